//! Coordinator-fed routing.
//!
//! A [`CoordinatedCluster`] reads its topology and options from the
//! registry and feeds its router's health map from the globally
//! aggregated status node instead of probing shards itself. One
//! [`CoordinatedSource`] value satisfies the router's three assembly
//! capabilities (topology reader, ring builder, and health checker), so
//! construction stays a plain dependency graph with no self-referential
//! start order.

use super::registry::ClusterRegistry;
use super::Coordinator;
use crate::backend::NodeDialer;
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::ring::{ConsistentRing, HashRing, NodeReader, RingBuilder};
use crate::router::{Cluster, Conn, Connector, RouterOptions};
use crate::types::{ClusterInfo, Shard, ShardStatus, StatusMap};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

const WATCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Topology reader, ring builder, and status subscriber in one value.
pub struct CoordinatedSource {
    registry: ClusterRegistry,
    info: ClusterInfo,
    state: AtomicU8,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinatedSource {
    /// Create a source for an already-fetched cluster description.
    pub fn new(registry: ClusterRegistry, info: ClusterInfo) -> Self {
        Self {
            registry,
            info,
            state: AtomicU8::new(STATE_IDLE),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Watch the global status node; forward entries that differ from
    /// what was already forwarded, applying only strictly newer node
    /// versions.
    async fn watch_status(
        coord: Arc<dyn Coordinator>,
        status_path: String,
        updates: mpsc::Sender<ShardStatus>,
        cancel: CancellationToken,
    ) {
        let mut known = StatusMap::new();
        let mut last_version = -1i64;
        loop {
            let (present, watch) = match coord.exists_w(&status_path).await {
                Ok(watched) => watched,
                Err(e) => {
                    warn!(error = %e, "status watch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(WATCH_RETRY_BACKOFF) => continue,
                    }
                }
            };

            if present.is_some_and(|stat| stat.version > last_version) {
                match coord.get(&status_path).await {
                    Ok((data, stat)) => {
                        match serde_json::from_slice::<StatusMap>(&data) {
                            Ok(map) => {
                                for (addr, status) in map {
                                    if known.get(&addr) == Some(&status) {
                                        continue;
                                    }
                                    known.insert(addr, status.clone());
                                    tokio::select! {
                                        _ = cancel.cancelled() => return,
                                        _ = updates.send(status) => {}
                                    }
                                }
                                last_version = stat.version;
                            }
                            Err(e) => warn!(error = %e, "unparsable global status"),
                        }
                    }
                    Err(e) => warn!(error = %e, "could not read global status"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = watch => {}
            }
        }
    }
}

#[async_trait]
impl NodeReader for CoordinatedSource {
    async fn read_nodes(&self) -> Result<Vec<Shard>> {
        let path = self.registry.shards_path(&self.info.name);
        let (data, _) = self
            .registry
            .coordinator()
            .get(&path)
            .await
            .map_err(|e| Error::ReadShards(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| Error::ReadShards(e.to_string()))
    }
}

impl RingBuilder for CoordinatedSource {
    fn build_ring(&self, shards: &[Shard]) -> Result<HashRing> {
        match self.info.options.ring_type.to_lowercase().as_str() {
            "consistent" => {
                // Absent or unparsable parameters fall back to one
                // point per shard.
                let replicas = self
                    .info
                    .options
                    .ring_params
                    .parse::<usize>()
                    .unwrap_or(shards.len());
                ConsistentRing::new(replicas.max(1)).build_ring(shards)
            }
            other => Err(Error::BuildRing(format!("unsupported ring type: {}", other))),
        }
    }
}

#[async_trait]
impl HealthChecker for CoordinatedSource {
    async fn start(&self, shards: &[Shard]) -> Result<mpsc::Receiver<ShardStatus>> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Config(
                "status subscriber already started; create a new instance".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(shards.len().max(1));
        let coord = self.registry.coordinator().clone();
        let status_path = self.registry.status_path(&self.info.name);
        self.tasks.lock().push(tokio::spawn(Self::watch_status(
            coord,
            status_path,
            tx,
            self.cancel.clone(),
        )));
        Ok(rx)
    }

    async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// A router whose topology and health view come from the coordination
/// service.
pub struct CoordinatedCluster {
    router: Cluster,
    info: ClusterInfo,
}

impl CoordinatedCluster {
    /// Connect under the default registry root.
    pub async fn new(
        coord: Arc<dyn Coordinator>,
        cluster_name: &str,
        dialer: Arc<dyn NodeDialer>,
    ) -> Result<Self> {
        Self::with_registry(ClusterRegistry::new(coord), cluster_name, dialer).await
    }

    /// Connect through an explicit registry.
    pub async fn with_registry(
        registry: ClusterRegistry,
        cluster_name: &str,
        dialer: Arc<dyn NodeDialer>,
    ) -> Result<Self> {
        let info = registry.get_cluster(cluster_name).await?;
        info!(
            cluster = %info.name,
            shards = info.shards.len(),
            failover = info.options.failover_enabled,
            "joining coordinated cluster"
        );

        let source = Arc::new(CoordinatedSource::new(registry, info.clone()));
        let options = RouterOptions::new(
            source.clone(),
            source.clone(),
            source,
            dialer,
        )
        .with_failover(info.options.failover_enabled);
        let router = Cluster::new(options).await?;

        Ok(Self { router, info })
    }

    /// The cluster description this router was built from.
    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    /// The router's live health map.
    pub fn health(&self) -> &crate::health::HealthMap {
        self.router.health()
    }
}

#[async_trait]
impl Connector for CoordinatedCluster {
    async fn connect(&self, key: &[u8]) -> Result<Conn> {
        self.router.connect(key).await
    }

    async fn shutdown(&self) {
        self.router.shutdown().await;
    }
}
