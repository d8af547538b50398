//! Error types for the sharded cache.

use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sharded cache.
#[derive(Error, Debug)]
pub enum Error {
    /// The key has no cached value (counted as a miss).
    #[error("no cached value for the key")]
    NoKey,

    /// A set or check-and-set was rejected by the atomic script
    /// because the store already holds a newer value.
    #[error("set rejected: a newer value exists for the key")]
    SetFailed,

    /// A reply from the backing node did not match the shape the
    /// protocol expects.
    #[error("unexpected reply shape from the backing node")]
    RespParse,

    /// The health checker has not decided a status for the routed
    /// shard yet. Internal to the router; surfaced as [`Error::NotAvail`]
    /// after the retry window.
    #[error("shard status is not known yet")]
    NotReady,

    /// No alive shard exists for the key (all down, or the ring is gone).
    #[error("no shard is available for the key")]
    NotAvail,

    /// Shard topology could not be read at construction time.
    #[error("failed to read shard topology: {0}")]
    ReadShards(String),

    /// The hash ring could not be built from the topology.
    #[error("failed to build a hash ring: {0}")]
    BuildRing(String),

    /// Backing-store I/O error, passed through from the client.
    #[error("transport error: {0}")]
    Transport(String),

    /// Coordination-service failure.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordError),

    /// Marshal/unmarshal failure for a key or value.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Invalid configuration or object misuse (e.g. restarting a
    /// stopped checker).
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coordination-service errors.
#[derive(Error, Debug)]
pub enum CoordError {
    /// The node does not exist.
    #[error("node not found: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// A versioned write lost the race.
    #[error("version mismatch on {0}")]
    BadVersion(String),

    /// The session is closed; ephemeral nodes are gone.
    #[error("coordination session closed")]
    Closed,

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Transport(e.to_string())
    }
}

impl Error {
    /// True if this is the miss marker returned by `get`.
    pub fn is_no_key(&self) -> bool {
        matches!(self, Error::NoKey)
    }
}
