//! In-process coordination service.
//!
//! A [`MemoryCoordination`] holds one node tree shared by any number of
//! sessions. Sessions implement [`Coordinator`]; closing a session reaps
//! its ephemeral nodes and fires the affected watches, which is exactly
//! the behavior the fleet checker's leader election relies on.

use super::{basename, parent, Coordinator, CreateMode, NodeStat, Watch};
use crate::error::{CoordError, Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// A shared in-process node tree.
#[derive(Default)]
pub struct MemoryCoordination {
    state: Arc<CoordState>,
}

#[derive(Default)]
struct CoordState {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<String, NodeEntry>,
    /// Fire on create, data change, or deletion of the keyed path.
    node_watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    /// Fire on child creation or deletion under the keyed path.
    child_watches: HashMap<String, Vec<oneshot::Sender<()>>>,
}

struct NodeEntry {
    data: Vec<u8>,
    version: i64,
    owner: Option<u64>,
    next_seq: u64,
}

impl Tree {
    fn fire_node(&mut self, path: &str) {
        if let Some(watchers) = self.node_watches.remove(path) {
            for watcher in watchers {
                let _ = watcher.send(());
            }
        }
    }

    fn fire_children(&mut self, path: &str) {
        if let Some(watchers) = self.child_watches.remove(path) {
            for watcher in watchers {
                let _ = watcher.send(());
            }
        }
    }

    fn watch_node(&mut self, path: &str) -> Watch {
        let (tx, rx) = oneshot::channel();
        self.node_watches.entry(path.to_string()).or_default().push(tx);
        rx
    }

    fn watch_children(&mut self, path: &str) -> Watch {
        let (tx, rx) = oneshot::channel();
        self.child_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        let mut names: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
            .map(|p| basename(p).to_string())
            .collect();
        names.sort();
        names
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes.keys().any(|p| p.starts_with(&prefix))
    }
}

impl MemoryCoordination {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session onto the shared tree.
    pub fn session(&self) -> Arc<MemorySession> {
        Arc::new(MemorySession {
            state: self.state.clone(),
            id: self.state.next_session.fetch_add(1, Ordering::SeqCst),
            closed: AtomicBool::new(false),
        })
    }
}

/// One session onto a [`MemoryCoordination`] tree.
pub struct MemorySession {
    state: Arc<CoordState>,
    id: u64,
    closed: AtomicBool,
}

impl MemorySession {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::Closed.into());
        }
        Ok(())
    }
}

fn no_node(path: &str) -> Error {
    CoordError::NoNode(path.to_string()).into()
}

#[async_trait]
impl Coordinator for MemorySession {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        self.check_open()?;
        let tree = self.state.tree.lock();
        let node = tree.nodes.get(path).ok_or_else(|| no_node(path))?;
        Ok((
            node.data.clone(),
            NodeStat {
                version: node.version,
            },
        ))
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, NodeStat, Watch)> {
        self.check_open()?;
        let mut tree = self.state.tree.lock();
        let (data, stat) = {
            let node = tree.nodes.get(path).ok_or_else(|| no_node(path))?;
            (
                node.data.clone(),
                NodeStat {
                    version: node.version,
                },
            )
        };
        let watch = tree.watch_node(path);
        Ok((data, stat, watch))
    }

    async fn set(&self, path: &str, data: Vec<u8>, version: i64) -> Result<NodeStat> {
        self.check_open()?;
        let mut tree = self.state.tree.lock();
        let node = tree.nodes.get_mut(path).ok_or_else(|| no_node(path))?;
        if version >= 0 && version != node.version {
            return Err(CoordError::BadVersion(path.to_string()).into());
        }
        node.data = data;
        node.version += 1;
        let stat = NodeStat {
            version: node.version,
        };
        tree.fire_node(path);
        Ok(stat)
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.check_open()?;
        let mut tree = self.state.tree.lock();

        let parent_path = parent(path);
        if !parent_path.is_empty() && !tree.nodes.contains_key(parent_path) {
            return Err(no_node(parent_path));
        }

        let (actual, owner) = match mode {
            CreateMode::Persistent => {
                if tree.nodes.contains_key(path) {
                    return Err(CoordError::NodeExists(path.to_string()).into());
                }
                (path.to_string(), None)
            }
            CreateMode::EphemeralSequential => {
                let seq = match tree.nodes.get_mut(parent_path) {
                    Some(parent_node) => {
                        let seq = parent_node.next_seq;
                        parent_node.next_seq += 1;
                        seq
                    }
                    None => return Err(no_node(parent_path)),
                };
                (format!("{}{:010}", path, seq), Some(self.id))
            }
        };

        tree.nodes.insert(
            actual.clone(),
            NodeEntry {
                data,
                version: 0,
                owner,
                next_seq: 0,
            },
        );
        tree.fire_node(&actual);
        if !parent_path.is_empty() {
            tree.fire_children(parent_path);
        }
        Ok(actual)
    }

    async fn delete(&self, path: &str, version: i64) -> Result<()> {
        self.check_open()?;
        let mut tree = self.state.tree.lock();
        let node = tree.nodes.get(path).ok_or_else(|| no_node(path))?;
        if version >= 0 && version != node.version {
            return Err(CoordError::BadVersion(path.to_string()).into());
        }
        if tree.has_children(path) {
            return Err(CoordError::Backend(format!("node not empty: {}", path)).into());
        }
        tree.nodes.remove(path);
        tree.fire_node(path);
        let parent_path = parent(path);
        if !parent_path.is_empty() {
            tree.fire_children(parent_path);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        self.check_open()?;
        let tree = self.state.tree.lock();
        Ok(tree.nodes.get(path).map(|node| NodeStat {
            version: node.version,
        }))
    }

    async fn exists_w(&self, path: &str) -> Result<(Option<NodeStat>, Watch)> {
        self.check_open()?;
        let mut tree = self.state.tree.lock();
        let stat = tree.nodes.get(path).map(|node| NodeStat {
            version: node.version,
        });
        let watch = tree.watch_node(path);
        Ok((stat, watch))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let tree = self.state.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(no_node(path));
        }
        Ok(tree.child_names(path))
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        self.check_open()?;
        let mut tree = self.state.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(no_node(path));
        }
        let names = tree.child_names(path);
        let watch = tree.watch_children(path);
        Ok((names, watch))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tree = self.state.tree.lock();
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(self.id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            tree.nodes.remove(&path);
            tree.fire_node(&path);
            let parent_path = parent(&path).to_string();
            if !parent_path.is_empty() {
                tree.fire_children(&parent_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_set_versions() {
        let service = MemoryCoordination::new();
        let session = service.session();

        session
            .create("/root", b"r".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let (data, stat) = session.get("/root").await.unwrap();
        assert_eq!(data, b"r");
        assert_eq!(stat.version, 0);

        let stat = session.set("/root", b"r2".to_vec(), 0).await.unwrap();
        assert_eq!(stat.version, 1);

        // Stale version is refused.
        let refused = session.set("/root", b"r3".to_vec(), 0).await;
        assert!(matches!(
            refused,
            Err(Error::Coordination(CoordError::BadVersion(_)))
        ));
        // Unchecked write goes through.
        session.set("/root", b"r3".to_vec(), -1).await.unwrap();
    }

    #[tokio::test]
    async fn missing_nodes_and_parents_error() {
        let service = MemoryCoordination::new();
        let session = service.session();

        assert!(matches!(
            session.get("/nope").await,
            Err(Error::Coordination(CoordError::NoNode(_)))
        ));
        assert!(session
            .create("/no/parent", vec![], CreateMode::Persistent)
            .await
            .is_err());
        assert!(session.children("/nope").await.is_err());
    }

    #[tokio::test]
    async fn sequential_names_are_ordered() {
        let service = MemoryCoordination::new();
        let session = service.session();
        session
            .create("/dir", vec![], CreateMode::Persistent)
            .await
            .unwrap();

        let a = session
            .create("/dir/n_", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let b = session
            .create("/dir/n_", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(a, "/dir/n_0000000000");
        assert_eq!(b, "/dir/n_0000000001");
        assert!(a < b);

        let children = session.children("/dir").await.unwrap();
        assert_eq!(children, vec!["n_0000000000", "n_0000000001"]);
    }

    #[tokio::test]
    async fn closing_a_session_reaps_its_ephemerals() {
        let service = MemoryCoordination::new();
        let owner = service.session();
        let other = service.session();
        owner
            .create("/dir", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        owner
            .create("/dir/n_", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();
        other
            .create("/dir/n_", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();

        let (_, watch) = other.children_w("/dir").await.unwrap();
        owner.close().await;

        // The ephemeral vanished and the child watch fired.
        watch.await.unwrap();
        let children = other.children("/dir").await.unwrap();
        assert_eq!(children, vec!["n_0000000001"]);

        // The closed session refuses further work.
        assert!(matches!(
            owner.get("/dir").await,
            Err(Error::Coordination(CoordError::Closed))
        ));
    }

    #[tokio::test]
    async fn node_watch_fires_on_set() {
        let service = MemoryCoordination::new();
        let session = service.session();
        session
            .create("/n", b"a".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let (_, _, watch) = session.get_w("/n").await.unwrap();
        session.set("/n", b"b".to_vec(), -1).await.unwrap();
        watch.await.unwrap();
    }

    #[tokio::test]
    async fn delete_requires_empty_node() {
        let service = MemoryCoordination::new();
        let session = service.session();
        session
            .create("/dir", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        session
            .create("/dir/kid", vec![], CreateMode::Persistent)
            .await
            .unwrap();

        assert!(session.delete("/dir", -1).await.is_err());
        session.delete("/dir/kid", -1).await.unwrap();
        session.delete("/dir", -1).await.unwrap();
        assert!(session.exists("/dir").await.unwrap().is_none());
    }
}
