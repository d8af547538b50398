//! Core types shared across the crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A logical backing node: placed on the ring by `name`, probed and
/// connected to at `addr`. Immutable for the life of a ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Ring identity.
    #[serde(rename = "Name")]
    pub name: String,

    /// Health and connection identity (`host:port`).
    #[serde(rename = "Addr")]
    pub addr: String,
}

impl Shard {
    /// Create a new shard description.
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

/// One shard's health at a point in time. Value semantics: two statuses
/// are the same iff address, verdict and timestamp all match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    /// The shard's connection address.
    #[serde(rename = "Addr")]
    pub addr: String,

    /// Whether the shard answered its last decisive probe.
    #[serde(rename = "Alive")]
    pub alive: bool,

    /// Microsecond timestamp at which this status began to hold.
    #[serde(rename = "Since")]
    pub since: i64,
}

impl ShardStatus {
    /// Create a status stamped with the current serial clock.
    pub fn now(addr: impl Into<String>, alive: bool) -> Self {
        Self {
            addr: addr.into(),
            alive,
            since: serial_now(),
        }
    }
}

/// Full health view: address to latest status. A missing entry means
/// "not yet known", which is distinct from `alive == false`.
pub type StatusMap = HashMap<String, ShardStatus>;

/// Cluster topology and behavior options as persisted in the
/// coordination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// Cluster name; the path component under the service root.
    pub name: String,

    /// Creation/update timestamp in decimal microseconds.
    pub version: i64,

    /// Behavior options.
    pub options: ClusterOptions,

    /// The shard set.
    pub shards: Vec<Shard>,
}

/// Behavior options persisted alongside the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOptions {
    /// Whether the router may walk past a dead primary.
    #[serde(rename = "FailoverEnabled")]
    pub failover_enabled: bool,

    /// Ring construction scheme; `"consistent"` is the only one defined.
    #[serde(rename = "RingType")]
    pub ring_type: String,

    /// Scheme parameters; for the consistent ring, the replica count in
    /// decimal.
    #[serde(rename = "RingParams")]
    pub ring_params: String,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            failover_enabled: true,
            ring_type: "consistent".to_string(),
            ring_params: String::new(),
        }
    }
}

/// Current time as a serial: microseconds since the Unix epoch.
///
/// Serials order writes per key; the backing node compares them
/// atomically, so cross-client ordering does not depend on clock
/// agreement beyond coarse sanity.
pub fn serial_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_wire_names() {
        let s = Shard::new("alpha", "127.0.0.1:6379");
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"Name\":\"alpha\""));
        assert!(json.contains("\"Addr\":\"127.0.0.1:6379\""));
        let back: Shard = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn status_value_semantics() {
        let a = ShardStatus {
            addr: "x:1".into(),
            alive: true,
            since: 7,
        };
        let b = a.clone();
        assert_eq!(a, b);
        let c = ShardStatus { since: 8, ..b };
        assert_ne!(a, c);
    }

    #[test]
    fn options_wire_names() {
        let o = ClusterOptions {
            failover_enabled: true,
            ring_type: "consistent".into(),
            ring_params: "128".into(),
        };
        let json = serde_json::to_string(&o).unwrap();
        assert!(json.contains("\"FailoverEnabled\":true"));
        assert!(json.contains("\"RingType\":\"consistent\""));
        assert!(json.contains("\"RingParams\":\"128\""));
    }

    #[test]
    fn serial_is_monotonic_enough() {
        let a = serial_now();
        let b = serial_now();
        assert!(b >= a);
        // Microsecond resolution: well past 2001 in micros.
        assert!(a > 1_000_000_000_000_000);
    }
}
