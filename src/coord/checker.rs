//! Distributed health checking over the coordination service.
//!
//! Every fleet checker runs an embedded probing checker against the
//! cluster's shards and publishes its beliefs, a full address-to-status
//! map, as the data of an ephemeral-sequential vote node. The checker
//! owning the lexicographically smallest vote node is the leader: it
//! re-tallies all votes whenever the vote directory changes and writes
//! the plurality decision to the cluster's global status node, which
//! routers subscribe to. Losing a session drops the vote node, and the
//! next smallest checker takes over on the watch that fires.

use super::registry::ClusterRegistry;
use super::{basename, Coordinator, CreateMode};
use crate::backend::NodeDialer;
use crate::config::CheckerOptions;
use crate::error::{CoordError, Error, Result};
use crate::health::{HealthChecker, LocalChecker};
use crate::types::{ShardStatus, StatusMap};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Backoff between retries when a coordination call inside a watch loop
/// fails.
const WATCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// One member of a checker fleet.
pub struct FleetChecker {
    registry: ClusterRegistry,
    cluster_name: String,
    local: Arc<LocalChecker>,
    vote: Arc<Mutex<StatusMap>>,
    id: Mutex<Option<String>>,
    state: AtomicU8,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetChecker {
    /// Create a checker for `cluster_name`, probing through `dialer`.
    pub fn new(
        registry: ClusterRegistry,
        cluster_name: impl Into<String>,
        options: CheckerOptions,
        dialer: Arc<dyn NodeDialer>,
    ) -> Self {
        Self {
            registry,
            cluster_name: cluster_name.into(),
            local: Arc::new(LocalChecker::new(options, dialer)),
            vote: Arc::new(Mutex::new(HashMap::new())),
            id: Mutex::new(None),
            state: AtomicU8::new(STATE_IDLE),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// This checker's vote-node identity, once started.
    pub fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    /// Read the topology, register the vote node, and run the election
    /// and vote-emission loops.
    pub async fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Config(
                "fleet checker already started; create a new instance".to_string(),
            ));
        }

        let info = self.registry.get_cluster(&self.cluster_name).await?;
        let id = self.register().await?;
        info!(cluster = %self.cluster_name, id = %id, "fleet checker registered");
        *self.id.lock() = Some(id.clone());

        let coord = self.registry.coordinator().clone();
        let local_path = self.registry.local_status_path(&self.cluster_name);
        let status_path = self.registry.status_path(&self.cluster_name);

        self.tasks.lock().push(tokio::spawn(Self::election_loop(
            coord.clone(),
            local_path.clone(),
            status_path,
            id.clone(),
            self.cancel.clone(),
        )));

        let updates = self.local.start(&info.shards).await?;
        self.tasks.lock().push(tokio::spawn(Self::vote_pump(
            updates,
            self.vote.clone(),
            coord,
            local_path.clone(),
            format!("{}/{}", local_path, id),
            self.cluster_name.clone(),
            self.cancel.clone(),
        )));

        Ok(())
    }

    /// Seed the vote from the last published global status and create
    /// the ephemeral-sequential vote node.
    async fn register(&self) -> Result<String> {
        let coord = self.registry.coordinator();
        let status_path = self.registry.status_path(&self.cluster_name);
        let local_path = self.registry.local_status_path(&self.cluster_name);

        if let Ok((data, _)) = coord.get(&status_path).await {
            match serde_json::from_slice::<StatusMap>(&data) {
                Ok(map) => *self.vote.lock() = map,
                Err(e) => warn!(error = %e, "ignoring unparsable global status"),
            }
        }

        if coord.exists(&local_path).await?.is_none() {
            let marker = self.cluster_name.as_bytes().to_vec();
            match coord.create(&local_path, marker, CreateMode::Persistent).await {
                Ok(_) | Err(Error::Coordination(CoordError::NodeExists(_))) => {}
                Err(e) => warn!(error = %e, "could not create vote directory"),
            }
        }

        let vote_bytes = serde_json::to_vec(&*self.vote.lock())?;
        let created = coord
            .create(
                &format!("{}/n_", local_path),
                vote_bytes,
                CreateMode::EphemeralSequential,
            )
            .await?;
        Ok(basename(&created).to_string())
    }

    /// Watch the vote directory; while this checker holds the smallest
    /// vote node, re-tally on every directory touch.
    async fn election_loop(
        coord: Arc<dyn Coordinator>,
        local_path: String,
        status_path: String,
        id: String,
        cancel: CancellationToken,
    ) {
        loop {
            let (mut voters, members_watch) = match coord.children_w(&local_path).await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(error = %e, "vote directory watch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(WATCH_RETRY_BACKOFF) => continue,
                    }
                }
            };
            voters.sort();

            if voters.first().map(String::as_str) == Some(id.as_str()) {
                info!(id = %id, "assumed checker leadership");
                loop {
                    let (present, leader_watch) = match coord.exists_w(&local_path).await {
                        Ok(watched) => watched,
                        Err(e) => {
                            warn!(error = %e, "leader watch failed");
                            break;
                        }
                    };
                    if present.is_some() {
                        Self::aggregate(coord.as_ref(), &local_path, &status_path).await;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = leader_watch => {}
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = members_watch => {}
            }
        }
    }

    /// Tally all votes and publish any plurality decisions that differ
    /// from the current global status. Failures are logged; the next
    /// watch retries.
    async fn aggregate(coord: &dyn Coordinator, local_path: &str, status_path: &str) {
        let (mut global, version) = match coord.get(status_path).await {
            Ok((data, stat)) => {
                let map = serde_json::from_slice::<StatusMap>(&data).unwrap_or_default();
                (map, stat.version)
            }
            Err(Error::Coordination(CoordError::NoNode(_))) => (StatusMap::new(), -1),
            Err(e) => {
                warn!(error = %e, "could not read global status");
                return;
            }
        };

        let voters = match coord.children(local_path).await {
            Ok(voters) => voters,
            Err(e) => {
                warn!(error = %e, "could not list voters");
                return;
            }
        };

        let mut ballot: HashMap<String, i64> = HashMap::new();
        for voter in &voters {
            let vote_path = format!("{}/{}", local_path, voter);
            let data = match coord.get(&vote_path).await {
                Ok((data, _)) => data,
                // A voter may drop between listing and reading.
                Err(e) => {
                    debug!(voter = %voter, error = %e, "skipping unreadable vote");
                    continue;
                }
            };
            let Ok(vote) = serde_json::from_slice::<StatusMap>(&data) else {
                warn!(voter = %voter, "skipping unparsable vote");
                continue;
            };
            for (addr, status) in vote {
                *ballot.entry(addr).or_insert(0) += if status.alive { 1 } else { -1 };
            }
        }

        let mut changed = false;
        for (addr, tally) in ballot {
            // A tie asserts nothing and defers to prior state.
            if tally == 0 {
                continue;
            }
            let alive = tally > 0;
            let differs = global.get(&addr).map_or(true, |s| s.alive != alive);
            if differs {
                info!(addr = %addr, alive, tally, "quorum decision");
                global.insert(addr.clone(), ShardStatus::now(addr, alive));
                changed = true;
            }
        }
        if !changed {
            return;
        }

        let bytes = match serde_json::to_vec(&global) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not encode global status");
                return;
            }
        };
        match coord.set(status_path, bytes.clone(), version).await {
            Ok(_) => {}
            Err(Error::Coordination(CoordError::NoNode(_))) => {
                if let Err(e) = coord
                    .create(status_path, bytes, CreateMode::Persistent)
                    .await
                {
                    warn!(error = %e, "could not create global status");
                }
            }
            // Lost a versioned race; the next watch re-aggregates.
            Err(e) => warn!(error = %e, "could not publish global status"),
        }
    }

    /// Consume local probe transitions; on each verdict change, rewrite
    /// the full vote and touch the vote directory to wake the leader.
    async fn vote_pump(
        mut updates: mpsc::Receiver<ShardStatus>,
        vote: Arc<Mutex<StatusMap>>,
        coord: Arc<dyn Coordinator>,
        local_path: String,
        node_path: String,
        cluster_name: String,
        cancel: CancellationToken,
    ) {
        loop {
            let status = tokio::select! {
                _ = cancel.cancelled() => return,
                status = updates.recv() => match status {
                    Some(status) => status,
                    None => return,
                },
            };

            let encoded = {
                let mut vote = vote.lock();
                let changed = vote
                    .get(&status.addr)
                    .map_or(true, |prev| prev.alive != status.alive);
                if !changed {
                    continue;
                }
                vote.insert(status.addr.clone(), status);
                serde_json::to_vec(&*vote)
            };
            let Ok(encoded) = encoded else {
                warn!("could not encode vote");
                continue;
            };

            match coord.set(&node_path, encoded, -1).await {
                Ok(_) => {
                    let marker = cluster_name.as_bytes().to_vec();
                    if let Err(e) = coord.set(&local_path, marker, -1).await {
                        warn!(error = %e, "could not touch vote directory");
                    }
                }
                Err(e) => warn!(error = %e, "could not write vote"),
            }
        }
    }

    /// Stop the loops and the embedded checker. Idempotent.
    pub async fn stop(&self) {
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
        self.local.stop().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(cluster = %self.cluster_name, "fleet checker stopped");
    }

    /// Stop, then close the coordination session so the vote node
    /// disappears immediately.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.registry.coordinator().close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::coord::memory::MemoryCoordination;
    use crate::types::{ClusterInfo, ClusterOptions, Shard};

    async fn seed_cluster(service: &MemoryCoordination, shards: Vec<Shard>) {
        let registry = ClusterRegistry::new(service.session());
        registry
            .create_cluster(&ClusterInfo {
                name: "fleet".into(),
                version: 0,
                options: ClusterOptions::default(),
                shards,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_registers_a_vote_node() {
        let service = MemoryCoordination::new();
        seed_cluster(&service, vec![Shard::new("a", "a:1")]).await;
        let backend = Arc::new(MemoryBackend::new());

        let checker = FleetChecker::new(
            ClusterRegistry::new(service.session()),
            "fleet",
            CheckerOptions::fast_for_tests(),
            backend,
        );
        checker.start().await.unwrap();
        let id = checker.id().unwrap();
        assert!(id.starts_with("n_"));

        let observer = service.session();
        let voters = observer
            .children("/goreclusters/fleet/localstatus")
            .await
            .unwrap();
        assert_eq!(voters, vec![id]);
        checker.stop().await;
    }

    #[tokio::test]
    async fn restart_is_refused() {
        let service = MemoryCoordination::new();
        seed_cluster(&service, vec![Shard::new("a", "a:1")]).await;
        let backend = Arc::new(MemoryBackend::new());
        let checker = FleetChecker::new(
            ClusterRegistry::new(service.session()),
            "fleet",
            CheckerOptions::fast_for_tests(),
            backend,
        );
        checker.start().await.unwrap();
        checker.stop().await;
        assert!(checker.start().await.is_err());
    }

    #[tokio::test]
    async fn start_without_topology_fails() {
        let service = MemoryCoordination::new();
        let backend = Arc::new(MemoryBackend::new());
        let checker = FleetChecker::new(
            ClusterRegistry::new(service.session()),
            "missing",
            CheckerOptions::fast_for_tests(),
            backend,
        );
        assert!(checker.start().await.is_err());
    }

    #[tokio::test]
    async fn single_checker_publishes_global_status() {
        let service = MemoryCoordination::new();
        seed_cluster(
            &service,
            vec![Shard::new("a", "a:1"), Shard::new("b", "b:1")],
        )
        .await;
        let backend = Arc::new(MemoryBackend::new());
        backend.set_down("b:1", true);

        let checker = FleetChecker::new(
            ClusterRegistry::new(service.session()),
            "fleet",
            CheckerOptions::fast_for_tests(),
            backend,
        );
        checker.start().await.unwrap();

        let observer = service.session();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Ok((data, _)) = observer.get("/goreclusters/fleet/status").await {
                if let Ok(map) = serde_json::from_slice::<StatusMap>(&data) {
                    if map.len() == 2 {
                        break map;
                    }
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "global status never published"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        assert!(status["a:1"].alive);
        assert!(!status["b:1"].alive);
        checker.shutdown().await;
    }
}
