//! Configuration types for the sharded cache.

use std::time::Duration;

/// Options controlling cache facade behavior.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Expiration applied to a key after every successful write.
    /// A zero duration disables expiration.
    pub expiration: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(60),
        }
    }
}

impl CacheOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-write expiration.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Disable expiration entirely.
    pub fn without_expiration(mut self) -> Self {
        self.expiration = Duration::ZERO;
        self
    }

    /// Expiration in whole seconds, as the atomic scripts consume it.
    pub fn expiration_secs(&self) -> u64 {
        self.expiration.as_secs()
    }
}

/// Options for the probing health checker.
#[derive(Debug, Clone)]
pub struct CheckerOptions {
    /// Number of probe workers. Workers may probe different shards
    /// concurrently; a single shard is never probed twice at once.
    pub workers: usize,

    /// Interval between probe requests per shard.
    pub interval: Duration,

    /// How long an up shard must fail probes before it is declared dead.
    pub threshold: Duration,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            interval: Duration::from_secs(1),
            threshold: Duration::from_secs(5),
        }
    }
}

impl CheckerOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the probe interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the dead-detection threshold.
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    /// A configuration with short intervals suitable for tests.
    pub fn fast_for_tests() -> Self {
        Self {
            workers: 2,
            interval: Duration::from_millis(20),
            threshold: Duration::from_millis(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_defaults() {
        let opts = CacheOptions::default();
        assert_eq!(opts.expiration, Duration::from_secs(60));
        assert_eq!(opts.expiration_secs(), 60);
    }

    #[test]
    fn cache_builder() {
        let opts = CacheOptions::new().with_expiration(Duration::from_secs(1));
        assert_eq!(opts.expiration_secs(), 1);
        let opts = opts.without_expiration();
        assert_eq!(opts.expiration_secs(), 0);
    }

    #[test]
    fn checker_builder() {
        let opts = CheckerOptions::new()
            .with_workers(0)
            .with_interval(Duration::from_millis(50))
            .with_threshold(Duration::from_secs(2));
        // Worker count is clamped to at least one.
        assert_eq!(opts.workers, 1);
        assert_eq!(opts.interval, Duration::from_millis(50));
        assert_eq!(opts.threshold, Duration::from_secs(2));
    }
}
