//! The cache facade.
//!
//! Values round-trip through JSON; the `_bytes` variants store and
//! return raw payloads untouched for callers that manage their own
//! encoding. Keys are marshaled with the same JSON policy, so any
//! serializable type can act as a key.
//!
//! Every successful write mints a fresh serial (microseconds); the
//! backing node rejects writes that would go backwards, and reads ignore
//! values older than the routing decision that selected the shard.

use crate::backend::NodeClient;
use crate::config::CacheOptions;
use crate::error::{Error, Result};
use crate::router::{Conn, Connector};
use crate::script::{entry_cas, entry_get, entry_set};
use crate::types::serial_now;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Sharded cache over a [`Connector`].
pub struct Cache {
    connector: Arc<dyn Connector>,
    options: CacheOptions,

    // Shared statistics; relaxed increments, reads may lag writes.
    hits: AtomicI64,
    misses: AtomicI64,
    loads: AtomicI64,
}

impl Cache {
    /// Create a cache with default options (60 s expiration).
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_options(connector, CacheOptions::default())
    }

    /// Create a cache with explicit options.
    pub fn with_options(connector: Arc<dyn Connector>, options: CacheOptions) -> Self {
        Self {
            connector,
            options,
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
            loads: AtomicI64::new(0),
        }
    }

    /// Fetch the cached value for `key`.
    ///
    /// Returns the value together with its serial. A missing or
    /// stale-beyond-routing value is [`Error::NoKey`] and counts as a
    /// miss.
    pub async fn get<K, V>(&self, key: &K) -> Result<(V, i64)>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let key = marshal(key)?;
        let (payload, serial) = self.read_value(&key).await?;
        let value = serde_json::from_slice(&payload)?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok((value, serial))
    }

    /// As [`Cache::get`], returning the stored payload verbatim.
    pub async fn get_bytes<K>(&self, key: &K) -> Result<(Bytes, i64)>
    where
        K: Serialize + ?Sized,
    {
        let key = marshal(key)?;
        let (payload, serial) = self.read_value(&key).await?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok((payload, serial))
    }

    /// Store `value` under `key`, returning the new serial.
    ///
    /// Fails with [`Error::SetFailed`] when the store already holds a
    /// newer value; the caller owns any retry policy.
    pub async fn set<K, V>(&self, key: &K, value: &V) -> Result<i64>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = marshal(key)?;
        let value = marshal(value)?;
        self.write_value(&key, &value, None).await
    }

    /// As [`Cache::set`], storing the payload verbatim.
    pub async fn set_bytes<K>(&self, key: &K, value: &[u8]) -> Result<i64>
    where
        K: Serialize + ?Sized,
    {
        let key = marshal(key)?;
        self.write_value(&key, value, None).await
    }

    /// Store `value` under `key` only if nothing newer than
    /// `old_serial` has been written meanwhile.
    pub async fn check_and_set<K, V>(&self, key: &K, value: &V, old_serial: i64) -> Result<i64>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = marshal(key)?;
        let value = marshal(value)?;
        self.write_value(&key, &value, Some(old_serial)).await
    }

    /// As [`Cache::check_and_set`], storing the payload verbatim.
    pub async fn check_and_set_bytes<K>(
        &self,
        key: &K,
        value: &[u8],
        old_serial: i64,
    ) -> Result<i64>
    where
        K: Serialize + ?Sized,
    {
        let key = marshal(key)?;
        self.write_value(&key, value, Some(old_serial)).await
    }

    /// Remove the cached value for `key`.
    pub async fn del<K>(&self, key: &K) -> Result<()>
    where
        K: Serialize + ?Sized,
    {
        let key = marshal(key)?;
        let mut conn = self.connector.connect(&key).await?;
        conn.client.command("DEL", &[key]).await?;
        Ok(())
    }

    /// Dispose the underlying connector.
    pub async fn shutdown(&self) {
        self.connector.shutdown().await;
    }

    /// Number of successful reads.
    pub fn hits(&self) -> i64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of reads that found nothing.
    pub fn misses(&self) -> i64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of successful writes.
    pub fn loads(&self) -> i64 {
        self.loads.load(Ordering::Relaxed)
    }

    async fn read_value(&self, key: &[u8]) -> Result<(Bytes, i64)> {
        let mut conn = self.connector.connect(key).await?;
        let since = conn.since;
        match entry_get(&mut conn.client, key, since).await? {
            Some(found) => Ok(found),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(Error::NoKey)
            }
        }
    }

    async fn write_value(&self, key: &[u8], value: &[u8], observed: Option<i64>) -> Result<i64> {
        let mut conn: Conn = self.connector.connect(key).await?;
        let serial = serial_now();
        let stored = match observed {
            None => {
                entry_set(
                    &mut conn.client,
                    key,
                    value,
                    serial,
                    self.options.expiration_secs(),
                )
                .await?
            }
            Some(old_serial) => {
                entry_cas(
                    &mut conn.client,
                    key,
                    value,
                    old_serial,
                    serial,
                    self.options.expiration_secs(),
                )
                .await?
            }
        };
        if !stored {
            return Err(Error::SetFailed);
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(serial)
    }
}

fn marshal<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::from)
}
