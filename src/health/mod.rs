//! Shard health: checker capability and the live status map.

pub mod local;

use crate::error::Result;
use crate::types::{Shard, ShardStatus, StatusMap};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

pub use local::LocalChecker;

/// Produces a stream of shard status transitions.
///
/// `start` emits an initial status for every shard as soon as it is
/// learned, then transitions only; per-shard ordering on the stream is
/// causal. `stop` must be idempotent and must not leak tasks; a checker
/// instance cannot be restarted after a stop.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Begin checking the given shards, returning the status stream.
    async fn start(&self, shards: &[Shard]) -> Result<mpsc::Receiver<ShardStatus>>;

    /// Stop all checking; the stream closes once in-flight work drains.
    async fn stop(&self);
}

/// Live shard health consumed by the router.
///
/// Written only by the single task pumping a checker's stream; read by
/// the router under the shared lock. A missing entry means the checker
/// has not decided yet, which routing treats differently from dead.
#[derive(Debug, Default)]
pub struct HealthMap {
    inner: RwLock<StatusMap>,
}

impl HealthMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status for `addr`, if any has been decided.
    pub fn get(&self, addr: &str) -> Option<ShardStatus> {
        self.inner.read().get(addr).cloned()
    }

    /// Record a status, replacing any previous one for the address.
    pub fn apply(&self, status: ShardStatus) {
        self.inner.write().insert(status.addr.clone(), status);
    }

    /// Copy of the whole map.
    pub fn snapshot(&self) -> StatusMap {
        self.inner.read().clone()
    }

    /// Number of addresses with a decided status.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when no status has been decided yet.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entry_is_distinct_from_dead() {
        let map = HealthMap::new();
        assert!(map.get("a:1").is_none());

        map.apply(ShardStatus {
            addr: "a:1".into(),
            alive: false,
            since: 1,
        });
        let status = map.get("a:1").unwrap();
        assert!(!status.alive);
    }

    #[test]
    fn apply_replaces_previous_status() {
        let map = HealthMap::new();
        map.apply(ShardStatus {
            addr: "a:1".into(),
            alive: false,
            since: 1,
        });
        map.apply(ShardStatus {
            addr: "a:1".into(),
            alive: true,
            since: 2,
        });
        let status = map.get("a:1").unwrap();
        assert!(status.alive);
        assert_eq!(status.since, 2);
        assert_eq!(map.len(), 1);
    }
}
