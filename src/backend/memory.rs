//! In-process backing nodes.
//!
//! A [`MemoryBackend`] is a dialer over a set of in-memory nodes keyed by
//! address, each implementing the same atomic per-key protocol a real
//! backing node executes (scripts are recognized by their source text).
//! Nodes can be marked down to exercise probe failures and failover
//! without external processes, so the end-to-end suite runs hermetically.

use super::{NodeClient, NodeDialer, Reply};
use crate::error::{Error, Result};
use crate::script::{CAS_SCRIPT, GET_SCRIPT, HISTORY_LIMIT, SET_SCRIPT};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A set of in-process backing nodes, addressable like real ones.
#[derive(Default)]
pub struct MemoryBackend {
    nodes: DashMap<String, Arc<MemoryNode>>,
}

impl MemoryBackend {
    /// Create an empty backend; nodes appear on first dial or access.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the node at `addr`.
    pub fn node(&self, addr: &str) -> Arc<MemoryNode> {
        self.nodes
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(MemoryNode::default()))
            .clone()
    }

    /// Mark the node at `addr` down or up. Down nodes refuse dials and
    /// fail every in-flight client operation.
    pub fn set_down(&self, addr: &str, down: bool) {
        self.node(addr).down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeDialer for MemoryBackend {
    async fn dial(&self, addr: &str) -> Result<Box<dyn NodeClient>> {
        let node = self.node(addr);
        if node.down.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("connection refused: {}", addr)));
        }
        Ok(Box::new(MemoryNodeClient { node }))
    }
}

/// One in-process backing node.
#[derive(Default)]
pub struct MemoryNode {
    down: AtomicBool,
    keys: Mutex<HashMap<Vec<u8>, ValueSet>>,
}

/// Sorted multiset of `(serial, value)` pairs with member-unique
/// semantics, plus a whole-key expiration deadline.
#[derive(Default)]
struct ValueSet {
    entries: BTreeSet<(i64, Vec<u8>)>,
    expires_at: Option<Instant>,
}

impl ValueSet {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn latest(&self) -> Option<&(i64, Vec<u8>)> {
        self.entries.iter().next_back()
    }

    fn insert(&mut self, serial: i64, value: Vec<u8>) {
        // Re-adding an existing member updates its serial.
        self.entries.retain(|(_, member)| member != &value);
        self.entries.insert((serial, value));
        while self.entries.len() > HISTORY_LIMIT {
            let oldest = self.entries.iter().next().cloned();
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
    }
}

impl MemoryNode {
    /// Number of live entries stored under `key`.
    pub fn entry_count(&self, key: &[u8]) -> usize {
        let mut keys = self.keys.lock();
        match keys.get(key) {
            Some(set) if !set.expired() => set.entries.len(),
            _ => 0,
        }
    }

    /// All serials stored under `key`, ascending.
    pub fn serials(&self, key: &[u8]) -> Vec<i64> {
        let mut keys = self.keys.lock();
        Self::drop_if_expired(&mut keys, key);
        keys.get(key)
            .map(|set| set.entries.iter().map(|(serial, _)| *serial).collect())
            .unwrap_or_default()
    }

    fn drop_if_expired(keys: &mut HashMap<Vec<u8>, ValueSet>, key: &[u8]) {
        if keys.get(key).is_some_and(|set| set.expired()) {
            keys.remove(key);
        }
    }

    fn run_get(&self, key: &[u8], args: &[Vec<u8>]) -> Result<Reply> {
        let valid_since = parse_i64(args.first())?;
        let mut keys = self.keys.lock();
        Self::drop_if_expired(&mut keys, key);
        match keys.get(key).and_then(|set| set.latest()) {
            Some((serial, value)) if *serial > valid_since => Ok(Reply::Array(vec![
                Reply::Bulk(value.clone()),
                Reply::Int(*serial),
            ])),
            _ => Ok(Reply::Nil),
        }
    }

    fn run_set(&self, key: &[u8], args: &[Vec<u8>]) -> Result<Reply> {
        let value = args.first().ok_or(Error::RespParse)?.clone();
        let serial = parse_i64(args.get(1))?;
        let expiry = parse_i64(args.get(2))?;
        self.write(key, value, serial, None, expiry)
    }

    fn run_cas(&self, key: &[u8], args: &[Vec<u8>]) -> Result<Reply> {
        let value = args.first().ok_or(Error::RespParse)?.clone();
        let old_serial = parse_i64(args.get(1))?;
        let new_serial = parse_i64(args.get(2))?;
        let expiry = parse_i64(args.get(3))?;
        self.write(key, value, new_serial, Some(old_serial), expiry)
    }

    fn write(
        &self,
        key: &[u8],
        value: Vec<u8>,
        serial: i64,
        observed: Option<i64>,
        expiry_secs: i64,
    ) -> Result<Reply> {
        let mut keys = self.keys.lock();
        Self::drop_if_expired(&mut keys, key);
        if let Some((stored, _)) = keys.get(key).and_then(|set| set.latest()) {
            if *stored > serial {
                return Ok(Reply::Nil);
            }
            if observed.is_some_and(|observed| *stored > observed) {
                return Ok(Reply::Nil);
            }
        }
        let set = keys.entry(key.to_vec()).or_default();
        set.insert(serial, value);
        if expiry_secs > 0 {
            set.expires_at = Some(Instant::now() + Duration::from_secs(expiry_secs as u64));
        }
        Ok(Reply::Int(1))
    }
}

fn parse_i64(arg: Option<&Vec<u8>>) -> Result<i64> {
    let arg = arg.ok_or(Error::RespParse)?;
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::RespParse)
}

/// Client handle onto one in-process node.
pub struct MemoryNodeClient {
    node: Arc<MemoryNode>,
}

impl MemoryNodeClient {
    fn check_up(&self) -> Result<()> {
        if self.node.down.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for MemoryNodeClient {
    async fn command(&mut self, cmd: &str, args: &[Vec<u8>]) -> Result<Reply> {
        self.check_up()?;
        match cmd {
            "PING" => Ok(Reply::Simple("PONG".to_string())),
            "DEL" => {
                let mut removed = 0;
                let mut keys = self.node.keys.lock();
                for key in args {
                    if keys.remove(key.as_slice()).is_some() {
                        removed += 1;
                    }
                }
                Ok(Reply::Int(removed))
            }
            other => Err(Error::Transport(format!("unsupported command: {}", other))),
        }
    }

    async fn eval(&mut self, script: &str, keys: &[&[u8]], args: &[Vec<u8>]) -> Result<Reply> {
        self.check_up()?;
        let key = keys.first().ok_or(Error::RespParse)?;
        // Scripts are identified by their stable source text.
        if script == GET_SCRIPT {
            self.node.run_get(key, args)
        } else if script == SET_SCRIPT {
            self.node.run_set(key, args)
        } else if script == CAS_SCRIPT {
            self.node.run_cas(key, args)
        } else {
            Err(Error::Transport("unrecognized script".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_answers_pong() {
        let backend = MemoryBackend::new();
        let mut client = backend.dial("a:1").await.unwrap();
        let reply = client.command("PING", &[]).await.unwrap();
        assert_eq!(reply, Reply::Simple("PONG".to_string()));
    }

    #[tokio::test]
    async fn down_node_refuses_dial_and_commands() {
        let backend = MemoryBackend::new();
        let mut client = backend.dial("a:1").await.unwrap();
        backend.set_down("a:1", true);
        assert!(backend.dial("a:1").await.is_err());
        assert!(client.command("PING", &[]).await.is_err());
        backend.set_down("a:1", false);
        assert!(client.command("PING", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn del_removes_keys() {
        let backend = MemoryBackend::new();
        let node = backend.node("a:1");
        node.write(b"k", b"v".to_vec(), 1, None, 0).unwrap();
        let mut client = backend.dial("a:1").await.unwrap();
        let reply = client.command("DEL", &[b"k".to_vec()]).await.unwrap();
        assert_eq!(reply, Reply::Int(1));
        assert_eq!(node.entry_count(b"k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire() {
        let backend = MemoryBackend::new();
        let node = backend.node("a:1");
        node.write(b"k", b"v".to_vec(), 1, None, 1).unwrap();
        assert_eq!(node.entry_count(b"k"), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(node.entry_count(b"k"), 0);
    }

    #[tokio::test]
    async fn readding_a_member_updates_its_serial() {
        let node = MemoryNode::default();
        node.write(b"k", b"v".to_vec(), 1, None, 0).unwrap();
        node.write(b"k", b"v".to_vec(), 5, None, 0).unwrap();
        assert_eq!(node.entry_count(b"k"), 1);
        assert_eq!(node.serials(b"k"), vec![5]);
    }
}
