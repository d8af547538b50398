//! Per-shard client pools.
//!
//! A pool holds up to `capacity` idle clients for one shard address.
//! Acquiring pops an idle client or dials a fresh one; releasing happens
//! when the [`PooledClient`] is dropped, and puts the client back unless
//! the free list is already full.

use super::{NodeClient, NodeDialer, Reply};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Default number of idle clients retained per shard.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// A lazy client pool for a single shard.
pub struct ShardPool {
    addr: String,
    dialer: Arc<dyn NodeDialer>,
    capacity: usize,
    idle: Mutex<Vec<Box<dyn NodeClient>>>,
}

impl ShardPool {
    /// Create an empty pool for `addr`. No connection is opened until
    /// the first acquire.
    pub fn new(addr: impl Into<String>, dialer: Arc<dyn NodeDialer>, capacity: usize) -> Self {
        Self {
            addr: addr.into(),
            dialer,
            capacity: capacity.max(1),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Take a client out of the pool, dialing a new one when the free
    /// list is empty.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledClient> {
        let reused = self.idle.lock().pop();
        let client = match reused {
            Some(client) => client,
            None => self.dialer.dial(&self.addr).await?,
        };
        Ok(PooledClient {
            client: Some(client),
            pool: Arc::clone(self),
        })
    }

    fn put(&self, client: Box<dyn NodeClient>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(client);
        }
    }

    /// Drop every idle client.
    pub fn drain(&self) {
        self.idle.lock().clear();
    }

    /// Number of idle clients currently retained.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A client checked out of a [`ShardPool`]; returns itself on drop.
pub struct PooledClient {
    client: Option<Box<dyn NodeClient>>,
    pool: Arc<ShardPool>,
}

#[async_trait]
impl NodeClient for PooledClient {
    async fn command(&mut self, cmd: &str, args: &[Vec<u8>]) -> Result<Reply> {
        match self.client.as_mut() {
            Some(client) => client.command(cmd, args).await,
            None => Err(Error::Transport("client already released".to_string())),
        }
    }

    async fn eval(&mut self, script: &str, keys: &[&[u8]], args: &[Vec<u8>]) -> Result<Reply> {
        match self.client.as_mut() {
            Some(client) => client.eval(script, keys, args).await,
            None => Err(Error::Transport("client already released".to_string())),
        }
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.put(client);
        }
    }
}
