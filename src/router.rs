//! Key-to-client routing.
//!
//! A [`Cluster`] resolves a key through the hash ring, consults the live
//! health map, optionally fails over along the ring, and hands back a
//! pooled client together with the `since` timestamp of the routing
//! decision. The [`Connector`] trait fronts it so the cache facade works
//! the same against a sharded router, a single node, or a
//! coordinator-fed variant.

use crate::backend::{NodeDialer, PooledClient, ShardPool, DEFAULT_POOL_SIZE};
use crate::error::{Error, Result};
use crate::health::{HealthChecker, HealthMap};
use crate::ring::{HashRing, NodeReader, RingBuilder};
use crate::types::Shard;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// How many times `connect` re-resolves while a shard's status is still
/// undecided, and how long it sleeps between attempts.
const NOT_READY_RETRIES: usize = 10;
const NOT_READY_BACKOFF: Duration = Duration::from_millis(100);

/// A live client resolved for one key.
///
/// Dropping the `client` returns it to its shard pool; callers must let
/// that happen on every path. `since` is when the selected shard's
/// current alive status began to hold, for validity checks against
/// cached serials.
pub struct Conn {
    /// Pooled client to the selected shard.
    pub client: PooledClient,

    /// Address of the selected shard.
    pub addr: String,

    /// Microsecond timestamp of the routing decision's status.
    pub since: i64,
}

/// Resolves keys to live backing-node clients.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Locate and connect to the node responsible for `key`.
    async fn connect(&self, key: &[u8]) -> Result<Conn>;

    /// Dispose the connector: stop health checking and drain pools.
    async fn shutdown(&self);
}

/// Assembly options for a [`Cluster`].
pub struct RouterOptions {
    /// Produces the shard topology.
    pub reader: Arc<dyn NodeReader>,

    /// Builds the ring from the topology.
    pub builder: Arc<dyn RingBuilder>,

    /// Drives the health map.
    pub checker: Arc<dyn HealthChecker>,

    /// Opens clients for pools.
    pub dialer: Arc<dyn NodeDialer>,

    /// Idle clients retained per shard.
    pub pool_size: usize,

    /// Whether resolution may walk past a dead shard.
    pub failover: bool,
}

impl RouterOptions {
    /// Create options with default pool size and failover disabled.
    pub fn new(
        reader: Arc<dyn NodeReader>,
        builder: Arc<dyn RingBuilder>,
        checker: Arc<dyn HealthChecker>,
        dialer: Arc<dyn NodeDialer>,
    ) -> Self {
        Self {
            reader,
            builder,
            checker,
            dialer,
            pool_size: DEFAULT_POOL_SIZE,
            failover: false,
        }
    }

    /// Set the per-shard pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Enable or disable failover.
    pub fn with_failover(mut self, failover: bool) -> Self {
        self.failover = failover;
        self
    }
}

/// Router over a sharded cluster of backing nodes.
pub struct Cluster {
    ring: RwLock<Option<HashRing>>,
    pools: DashMap<String, Arc<ShardPool>>,
    pool_size: usize,
    dialer: Arc<dyn NodeDialer>,
    checker: Arc<dyn HealthChecker>,
    health: Arc<HealthMap>,
    failover: bool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Read the topology, build the ring, start the checker, and begin
    /// pumping status updates into the health map.
    pub async fn new(options: RouterOptions) -> Result<Self> {
        let shards = options
            .reader
            .read_nodes()
            .await
            .map_err(|e| Error::ReadShards(e.to_string()))?;
        let ring = options.builder.build_ring(&shards)?;

        let health = Arc::new(HealthMap::new());
        let mut updates = options.checker.start(&shards).await?;
        let pump_health = health.clone();
        let pump = tokio::spawn(async move {
            while let Some(status) = updates.recv().await {
                pump_health.apply(status);
            }
        });

        info!(shards = shards.len(), failover = options.failover, "cluster router up");

        Ok(Self {
            ring: RwLock::new(Some(ring)),
            pools: DashMap::new(),
            pool_size: options.pool_size.max(1),
            dialer: options.dialer,
            checker: options.checker,
            health,
            failover: options.failover,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// The live health map the router consults.
    pub fn health(&self) -> &HealthMap {
        &self.health
    }

    /// Walk the ring for `key` against the current health view.
    fn resolve(&self, key: &[u8]) -> Result<(Shard, i64)> {
        let guard = self.ring.read();
        let Some(ring) = guard.as_ref() else {
            return Err(Error::NotAvail);
        };

        for shard in ring.scan(key) {
            match self.health.get(&shard.addr) {
                None => return Err(Error::NotReady),
                Some(status) if status.alive => return Ok((shard.clone(), status.since)),
                Some(_) if self.failover => continue,
                Some(_) => break,
            }
        }
        Err(Error::NotAvail)
    }
}

#[async_trait]
impl Connector for Cluster {
    async fn connect(&self, key: &[u8]) -> Result<Conn> {
        // A fresh router may not have decided every status yet; give the
        // checker a bounded window to settle instead of failing hard.
        let mut resolved = self.resolve(key);
        for _ in 0..NOT_READY_RETRIES {
            if !matches!(resolved, Err(Error::NotReady)) {
                break;
            }
            tokio::time::sleep(NOT_READY_BACKOFF).await;
            resolved = self.resolve(key);
        }
        let (shard, since) = match resolved {
            Ok(found) => found,
            Err(Error::NotReady) => return Err(Error::NotAvail),
            Err(e) => return Err(e),
        };

        let pool = self
            .pools
            .entry(shard.addr.clone())
            .or_insert_with(|| {
                Arc::new(ShardPool::new(
                    shard.addr.clone(),
                    self.dialer.clone(),
                    self.pool_size,
                ))
            })
            .clone();
        let client = pool.acquire().await?;
        Ok(Conn {
            client,
            addr: shard.addr,
            since,
        })
    }

    async fn shutdown(&self) {
        self.checker.stop().await;
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        *self.ring.write() = None;
        for entry in self.pools.iter() {
            entry.value().drain();
        }
        self.pools.clear();
        info!("cluster router shut down");
    }
}

/// Connector for a single unsharded node. No health checking; the
/// routing validity timestamp is always zero.
pub struct SingleNode {
    pool: Arc<ShardPool>,
}

impl SingleNode {
    /// Create a connector pooling clients to one address.
    pub fn new(addr: impl Into<String>, dialer: Arc<dyn NodeDialer>, pool_size: usize) -> Self {
        let addr = addr.into();
        Self {
            pool: Arc::new(ShardPool::new(addr, dialer, pool_size)),
        }
    }
}

#[async_trait]
impl Connector for SingleNode {
    async fn connect(&self, _key: &[u8]) -> Result<Conn> {
        let client = self.pool.acquire().await?;
        Ok(Conn {
            client,
            addr: String::new(),
            since: 0,
        })
    }

    async fn shutdown(&self) {
        self.pool.drain();
    }
}
