//! Cluster topology persisted in the coordination service.
//!
//! Layout under the configurable root (default `/goreclusters`, kept
//! wire-compatible with existing deployments):
//!
//! ```text
//! /<root>                    data: root name
//! /<root>/<cluster>          data: decimal microsecond timestamp
//! /<root>/<cluster>/shards   data: JSON [{Name, Addr}, ...]
//! /<root>/<cluster>/options  data: JSON {FailoverEnabled, RingType, RingParams}
//! /<root>/<cluster>/status   data: JSON {addr: {Addr, Alive, Since}}, versioned
//! /<root>/<cluster>/localstatus  data: cluster name; ephemeral-sequential
//!                                children n_XXXXXXXXXX carry checker votes
//! ```

use super::{basename, Coordinator, CreateMode};
use crate::error::{CoordError, Error, Result};
use crate::types::{serial_now, ClusterInfo, ClusterOptions, Shard};
use std::sync::Arc;
use tracing::warn;

/// Default service root.
pub const DEFAULT_ROOT: &str = "/goreclusters";

/// Reads and writes cluster topology at the §layout paths.
#[derive(Clone)]
pub struct ClusterRegistry {
    coord: Arc<dyn Coordinator>,
    root: String,
}

impl ClusterRegistry {
    /// Registry under the default root.
    pub fn new(coord: Arc<dyn Coordinator>) -> Self {
        Self::with_root(coord, DEFAULT_ROOT)
    }

    /// Registry under a custom root path.
    pub fn with_root(coord: Arc<dyn Coordinator>, root: impl Into<String>) -> Self {
        Self {
            coord,
            root: root.into(),
        }
    }

    /// The underlying session.
    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coord
    }

    /// Path of a cluster's node.
    pub fn cluster_path(&self, name: &str) -> String {
        format!("{}/{}", self.root, name)
    }

    /// Path of a cluster's shard list.
    pub fn shards_path(&self, name: &str) -> String {
        format!("{}/{}/shards", self.root, name)
    }

    /// Path of a cluster's options.
    pub fn options_path(&self, name: &str) -> String {
        format!("{}/{}/options", self.root, name)
    }

    /// Path of a cluster's aggregated status.
    pub fn status_path(&self, name: &str) -> String {
        format!("{}/{}/status", self.root, name)
    }

    /// Path of a cluster's per-checker vote directory.
    pub fn local_status_path(&self, name: &str) -> String {
        format!("{}/{}/localstatus", self.root, name)
    }

    /// Create the root node if it is missing.
    pub async fn ensure_root(&self) -> Result<()> {
        if self.coord.exists(&self.root).await?.is_some() {
            return Ok(());
        }
        let marker = basename(&self.root).as_bytes().to_vec();
        match self
            .coord
            .create(&self.root, marker, CreateMode::Persistent)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Coordination(CoordError::NodeExists(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read one cluster's full description.
    pub async fn get_cluster(&self, name: &str) -> Result<ClusterInfo> {
        let (stamp, _) = self.coord.get(&self.cluster_path(name)).await?;
        let version = std::str::from_utf8(&stamp)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let (shard_bytes, _) = self.coord.get(&self.shards_path(name)).await?;
        let shards: Vec<Shard> = serde_json::from_slice(&shard_bytes)?;

        let (option_bytes, _) = self.coord.get(&self.options_path(name)).await?;
        let options: ClusterOptions = serde_json::from_slice(&option_bytes)?;

        Ok(ClusterInfo {
            name: name.to_string(),
            version,
            options,
            shards,
        })
    }

    /// Read every cluster under the root; unreadable clusters are
    /// logged and skipped.
    pub async fn list_clusters(&self) -> Result<Vec<ClusterInfo>> {
        let names = self.coord.children(&self.root).await?;
        let mut clusters = Vec::with_capacity(names.len());
        for name in names {
            match self.get_cluster(&name).await {
                Ok(info) => clusters.push(info),
                Err(e) => warn!(cluster = %name, error = %e, "skipping unreadable cluster"),
            }
        }
        Ok(clusters)
    }

    /// Persist a new cluster. Partially created nodes are rolled back
    /// on failure.
    pub async fn create_cluster(&self, info: &ClusterInfo) -> Result<()> {
        self.ensure_root().await?;

        let cluster_path = self.cluster_path(&info.name);
        if self.coord.exists(&cluster_path).await?.is_some() {
            return Err(CoordError::NodeExists(cluster_path).into());
        }

        let stamp = serial_now().to_string().into_bytes();
        let shard_bytes = serde_json::to_vec(&info.shards)?;
        let option_bytes = serde_json::to_vec(&info.options)?;

        self.coord
            .create(&cluster_path, stamp, CreateMode::Persistent)
            .await?;

        let shards_path = self.shards_path(&info.name);
        if let Err(e) = self
            .coord
            .create(&shards_path, shard_bytes, CreateMode::Persistent)
            .await
        {
            self.rollback(&cluster_path).await;
            return Err(e);
        }

        if let Err(e) = self
            .coord
            .create(&self.options_path(&info.name), option_bytes, CreateMode::Persistent)
            .await
        {
            self.rollback(&shards_path).await;
            self.rollback(&cluster_path).await;
            return Err(e);
        }

        Ok(())
    }

    async fn rollback(&self, path: &str) {
        if let Err(e) = self.coord.delete(path, -1).await {
            warn!(path, error = %e, "rollback delete failed");
        }
    }

    /// Rewrite an existing cluster's shards and options, then bump its
    /// timestamp.
    pub async fn update_cluster(&self, info: &ClusterInfo) -> Result<()> {
        let cluster_path = self.cluster_path(&info.name);
        if self.coord.exists(&cluster_path).await?.is_none() {
            return Err(CoordError::NoNode(cluster_path).into());
        }

        let shard_bytes = serde_json::to_vec(&info.shards)?;
        let option_bytes = serde_json::to_vec(&info.options)?;
        self.coord
            .set(&self.shards_path(&info.name), shard_bytes, -1)
            .await?;
        self.coord
            .set(&self.options_path(&info.name), option_bytes, -1)
            .await?;
        self.coord
            .set(&cluster_path, serial_now().to_string().into_bytes(), -1)
            .await?;
        Ok(())
    }

    /// Remove a cluster and everything under it. Child deletion
    /// failures are logged; the final delete error is returned.
    pub async fn delete_cluster(&self, name: &str) -> Result<()> {
        let cluster_path = self.cluster_path(name);
        if self.coord.exists(&cluster_path).await?.is_none() {
            return Err(CoordError::NoNode(cluster_path).into());
        }

        if let Ok(children) = self.coord.children(&cluster_path).await {
            for child in children {
                let child_path = format!("{}/{}", cluster_path, child);
                // Vote directories nest one level deeper.
                if let Ok(grandchildren) = self.coord.children(&child_path).await {
                    for grandchild in grandchildren {
                        let path = format!("{}/{}", child_path, grandchild);
                        if let Err(e) = self.coord.delete(&path, -1).await {
                            warn!(path = %path, error = %e, "failed to delete node");
                        }
                    }
                }
                if let Err(e) = self.coord.delete(&child_path, -1).await {
                    warn!(path = %child_path, error = %e, "failed to delete node");
                }
            }
        }

        self.coord.delete(&cluster_path, -1).await
    }
}
