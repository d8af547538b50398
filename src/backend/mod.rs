//! Capability layer over the backing key/value nodes.
//!
//! The core of the crate never talks to a concrete store; it works
//! against [`NodeClient`] (generic command dispatch plus atomic script
//! evaluation) and [`NodeDialer`] (opening a client to an address).
//! [`redis::RedisDialer`] is the production implementation;
//! [`memory::MemoryBackend`] is the in-process one used by embedded
//! setups and the test suite.

pub mod memory;
pub mod pool;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;

pub use pool::{PooledClient, ShardPool, DEFAULT_POOL_SIZE};

/// A reply from a backing node, tagged by protocol type.
///
/// Error replies surface as [`crate::Error::Transport`] instead of a
/// variant here, so match arms only deal with data shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Absent value.
    Nil,
    /// Integer reply.
    Int(i64),
    /// Binary-safe string reply.
    Bulk(Vec<u8>),
    /// Simple status line, e.g. `PONG`.
    Simple(String),
    /// Array of nested replies.
    Array(Vec<Reply>),
}

impl Reply {
    /// True if the reply is the absent-value marker.
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}

/// A single client connection to one backing node.
#[async_trait]
pub trait NodeClient: Send {
    /// Dispatch a plain command with binary-safe arguments.
    async fn command(&mut self, cmd: &str, args: &[Vec<u8>]) -> Result<Reply>;

    /// Evaluate an atomic script with the given keys and arguments.
    ///
    /// Implementations may cache scripts by digest; the source text is
    /// the script's identity.
    async fn eval(&mut self, script: &str, keys: &[&[u8]], args: &[Vec<u8>]) -> Result<Reply>;
}

/// Opens clients to backing nodes by address. Timeout policy belongs to
/// the dialer, not to callers.
#[async_trait]
pub trait NodeDialer: Send + Sync {
    /// Open a new client to `addr`.
    async fn dial(&self, addr: &str) -> Result<Box<dyn NodeClient>>;
}
