//! Client-side sharded cache over Redis-protocol backing nodes.
//!
//! This crate provides a cache facade whose keys are spread across many
//! backing nodes:
//! - **Atomic per-key protocol**: every read and write runs as a single
//!   script on the backing node, ordering racing clients by monotonic
//!   serials and keeping a bounded per-key history
//! - **Consistent-hash routing**: a hash ring with virtual points maps
//!   keys to shards; a cursor walks the ring for failover
//! - **Live health**: a probing checker with flap damping feeds the
//!   router's health map, either directly or through a
//!   coordination-service fleet with leader election and vote tallying
//!
//! # Example
//!
//! ```rust,no_run
//! use shardcache::{Cache, CheckerOptions, Cluster, ConsistentRing};
//! use shardcache::{LocalChecker, RedisDialer, RouterOptions, Shard, StaticNodes};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shards = vec![
//!         Shard::new("alpha", "10.0.0.1:6379"),
//!         Shard::new("beta", "10.0.0.2:6379"),
//!     ];
//!     let dialer = Arc::new(RedisDialer::new());
//!     let router = Cluster::new(
//!         RouterOptions::new(
//!             Arc::new(StaticNodes(shards)),
//!             Arc::new(ConsistentRing::new(128)),
//!             Arc::new(LocalChecker::new(CheckerOptions::default(), dialer.clone())),
//!             dialer,
//!         )
//!         .with_failover(true),
//!     )
//!     .await?;
//!     let cache = Cache::new(Arc::new(router));
//!
//!     let serial = cache.set(&"greeting", &"hello").await?;
//!     let (value, got): (String, i64) = cache.get(&"greeting").await?;
//!     assert_eq!(value, "hello");
//!     assert_eq!(got, serial);
//!     cache.del(&"greeting").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Cache facade                  │
//! │   get / set / check_and_set / del + counters   │
//! └───────────────────────────────────────────────┘
//!                        │ Connector
//!                        ▼
//! ┌───────────────────────────────────────────────┐
//! │                 Cluster router                 │
//! │   HashRing scan ──► HealthMap ──► ShardPool    │
//! └───────────────────────────────────────────────┘
//!          ▲                               ▲
//!          │ status stream                 │ NodeClient
//! ┌─────────────────┐              ┌──────────────────┐
//! │  LocalChecker   │              │  backing nodes   │
//! │  or fleet-fed   │──── PING ───►│  (Redis protocol)│
//! │  subscriber     │              └──────────────────┘
//! └─────────────────┘
//! ```
//!
//! # Coordinated fleets
//!
//! For deployments where many hosts should agree on shard health, run a
//! [`FleetChecker`] per host and point routers at the cluster through
//! [`CoordinatedCluster`]:
//!
//! ```rust,ignore
//! let registry = ClusterRegistry::new(session.clone());
//! let checker = FleetChecker::new(registry, "main", CheckerOptions::default(), dialer.clone());
//! checker.start().await?;
//!
//! let cluster = CoordinatedCluster::new(session, "main", dialer).await?;
//! let cache = Cache::new(Arc::new(cluster));
//! ```
//!
//! The checker fleet elects the member with the smallest vote node as
//! leader; the leader tallies everyone's vote on each change and
//! publishes the plurality decision, which every subscribed router
//! applies to its health map.
//!
//! # Consistency model
//!
//! - **Per-key writes**: totally ordered by the backing node's atomic
//!   scripts; stale serials are rejected, never overwritten
//! - **Reads**: values older than the routing decision that selected the
//!   shard are treated as misses, forcing re-resolution after failover
//! - **Health**: eventually consistent; per-shard transitions are
//!   causally ordered, and global status writes are versioned

pub mod backend;
pub mod cache;
pub mod config;
pub mod coord;
pub mod error;
pub mod health;
pub mod ring;
pub mod router;
pub mod script;
pub mod testing;
pub mod types;

// Re-export the main surface for convenience.
pub use cache::Cache;
pub use config::{CacheOptions, CheckerOptions};
pub use error::{CoordError, Error, Result};

pub use backend::memory::MemoryBackend;
pub use backend::redis::RedisDialer;
pub use backend::{NodeClient, NodeDialer, PooledClient, Reply, ShardPool, DEFAULT_POOL_SIZE};

pub use health::{HealthChecker, HealthMap, LocalChecker};
pub use ring::{crc32_hash, ConsistentRing, HashFn, HashRing, NodeReader, RingBuilder, RingScan, StaticNodes};
pub use router::{Cluster, Conn, Connector, RouterOptions, SingleNode};
pub use types::{serial_now, ClusterInfo, ClusterOptions, Shard, ShardStatus, StatusMap};

pub use coord::{
    ClusterRegistry, CoordinatedCluster, Coordinator, CreateMode, FleetChecker,
    MemoryCoordination, MemorySession, NodeStat, Watch, DEFAULT_ROOT,
};

pub use script::{CAS_SCRIPT, GET_SCRIPT, HISTORY_LIMIT, SET_SCRIPT};
