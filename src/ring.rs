//! Consistent hashing with a failover cursor.
//!
//! Keys map to shards through a ring of `replicas × |shards|` integer
//! points. [`HashRing::scan`] resolves a key to its primary shard and
//! then walks ring order as a cursor, yielding each distinct shard at
//! most once, so the router can fail over without the ring knowing
//! anything about health.

use crate::error::{Error, Result};
use crate::types::Shard;
use async_trait::async_trait;
use crc::{Crc, CRC_32_ISO_HDLC};

/// Hash function used for ring points and key placement.
pub type HashFn = fn(&[u8]) -> u32;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Default ring hash: CRC-32/IEEE.
pub fn crc32_hash(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Produces the shard set a ring is built from.
#[async_trait]
pub trait NodeReader: Send + Sync {
    /// Read the current shard topology.
    async fn read_nodes(&self) -> Result<Vec<Shard>>;
}

/// A fixed shard list.
pub struct StaticNodes(pub Vec<Shard>);

#[async_trait]
impl NodeReader for StaticNodes {
    async fn read_nodes(&self) -> Result<Vec<Shard>> {
        Ok(self.0.clone())
    }
}

/// Builds a ring from a shard set.
pub trait RingBuilder: Send + Sync {
    /// Build the ring. The same input must always yield the same ring.
    fn build_ring(&self, shards: &[Shard]) -> Result<HashRing>;
}

#[derive(Debug, Clone, Copy)]
struct RingPoint {
    point: u32,
    shard: usize,
    replica: u32,
}

/// An immutable hash ring. Built once per router lifetime; a rebuild is
/// a full replacement.
#[derive(Debug, Clone)]
pub struct HashRing {
    hash: HashFn,
    points: Vec<RingPoint>,
    shards: Vec<Shard>,
}

impl HashRing {
    /// Number of points on the ring.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the ring carries no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The shard set the ring was built from.
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Resolve `key` to a cursor over candidate shards.
    ///
    /// The first yield is the primary (owner of the smallest point at or
    /// after the key's hash, wrapping to the start); subsequent yields
    /// follow ring order, skipping shards already seen, and end after one
    /// full wrap. Each distinct shard is yielded at most once.
    pub fn scan(&self, key: &[u8]) -> RingScan<'_> {
        let hash = (self.hash)(key);
        let mut start = self.points.partition_point(|p| p.point < hash);
        if start >= self.points.len() {
            start = 0;
        }
        RingScan {
            ring: self,
            start,
            offset: 0,
            yielded: vec![false; self.shards.len()],
        }
    }
}

/// Cursor state for one key resolution. See [`HashRing::scan`].
pub struct RingScan<'a> {
    ring: &'a HashRing,
    start: usize,
    offset: usize,
    yielded: Vec<bool>,
}

impl<'a> Iterator for RingScan<'a> {
    type Item = &'a Shard;

    fn next(&mut self) -> Option<&'a Shard> {
        let total = self.ring.points.len();
        while self.offset < total {
            let idx = (self.start + self.offset) % total;
            self.offset += 1;
            let shard = self.ring.points[idx].shard;
            if !self.yielded[shard] {
                self.yielded[shard] = true;
                return Some(&self.ring.shards[shard]);
            }
        }
        None
    }
}

/// The standard ring builder: `replicas` points per shard, hashed from
/// the replica index concatenated with the shard name.
#[derive(Clone)]
pub struct ConsistentRing {
    /// Points per shard; clamped to at least one.
    pub replicas: usize,

    /// Ring hash; defaults to CRC-32/IEEE.
    pub hash: Option<HashFn>,
}

impl ConsistentRing {
    /// Create a builder with the given replica count and default hash.
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            hash: None,
        }
    }

    /// Override the hash function.
    pub fn with_hash(mut self, hash: HashFn) -> Self {
        self.hash = Some(hash);
        self
    }
}

impl RingBuilder for ConsistentRing {
    fn build_ring(&self, shards: &[Shard]) -> Result<HashRing> {
        let replicas = self.replicas.max(1);
        let hash = self.hash.unwrap_or(crc32_hash);

        let mut names = std::collections::HashSet::new();
        for shard in shards {
            if !names.insert(shard.name.as_str()) {
                return Err(Error::BuildRing(format!(
                    "duplicate shard name: {}",
                    shard.name
                )));
            }
        }

        let mut points = Vec::with_capacity(replicas * shards.len());
        for (idx, shard) in shards.iter().enumerate() {
            for replica in 0..replicas {
                let label = format!("{}{}", replica, shard.name);
                points.push(RingPoint {
                    point: hash(label.as_bytes()),
                    shard: idx,
                    replica: replica as u32,
                });
            }
        }
        // Ties on the raw point value break by shard name, then replica
        // index, so identical inputs always produce identical rings.
        points.sort_by(|a, b| {
            a.point
                .cmp(&b.point)
                .then_with(|| shards[a.shard].name.cmp(&shards[b.shard].name))
                .then_with(|| a.replica.cmp(&b.replica))
        });

        Ok(HashRing {
            hash,
            points,
            shards: shards.to_vec(),
        })
    }
}
