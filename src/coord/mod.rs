//! Coordination-service capability and the fleet built on it.
//!
//! The cache core consumes a ZooKeeper-style service through the
//! [`Coordinator`] trait: versioned nodes, ephemeral-sequential
//! children, and one-shot watches. [`memory::MemoryCoordination`]
//! implements it in-process for embedded fleets and tests; any external
//! client with the same primitives can be adapted onto the trait.
//!
//! On top of the capability sit the topology registry
//! ([`registry::ClusterRegistry`]), the distributed checker
//! ([`checker::FleetChecker`]) and the coordinator-fed router
//! ([`cluster::CoordinatedCluster`]).

pub mod checker;
pub mod cluster;
pub mod memory;
pub mod registry;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

pub use checker::FleetChecker;
pub use cluster::CoordinatedCluster;
pub use memory::{MemoryCoordination, MemorySession};
pub use registry::{ClusterRegistry, DEFAULT_ROOT};

/// Metadata for a coordination node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Data version; starts at zero and increments on every set.
    pub version: i64,
}

/// Creation mode for coordination nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives sessions.
    Persistent,

    /// Bound to the creating session and suffixed with a monotonically
    /// increasing ten-digit sequence.
    EphemeralSequential,
}

/// One-shot event channel returned by the watch variants. It resolves
/// on the first relevant change, or errors when the session ends.
pub type Watch = oneshot::Receiver<()>;

/// Client session onto a coordination service.
///
/// Ephemeral nodes created through a session vanish when that session
/// closes. Watches are one-shot: re-arm by calling the `_w` variant
/// again after the event fires.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Read a node's data and stat.
    async fn get(&self, path: &str) -> Result<(Vec<u8>, NodeStat)>;

    /// As `get`, also watching the node for the next change.
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, NodeStat, Watch)>;

    /// Write a node's data. `version` must match the current version,
    /// or be `-1` for an unchecked write.
    async fn set(&self, path: &str, data: Vec<u8>, version: i64) -> Result<NodeStat>;

    /// Create a node, returning its actual path (sequential creations
    /// append the sequence number).
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Delete a node. `version` as for `set`.
    async fn delete(&self, path: &str, version: i64) -> Result<()>;

    /// Stat a node if it exists.
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>>;

    /// As `exists`, also watching the path for creation, data change,
    /// or deletion.
    async fn exists_w(&self, path: &str) -> Result<(Option<NodeStat>, Watch)>;

    /// Names of a node's direct children.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// As `children`, also watching for child creation or deletion.
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// End the session; ephemeral nodes are reaped.
    async fn close(&self);
}

/// Final path component.
pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent path, or empty for top-level nodes.
pub(crate) fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(idx) => &path[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(basename("/a/b/c"), "c");
        assert_eq!(basename("/a"), "a");
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(parent("/a"), "");
        assert_eq!(parent("a"), "");
    }
}
