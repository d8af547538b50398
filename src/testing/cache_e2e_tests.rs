//! End-to-end cache scenarios over a sharded in-process cluster.

#[cfg(test)]
mod tests {
    use crate::backend::memory::MemoryBackend;
    use crate::cache::Cache;
    use crate::config::{CacheOptions, CheckerOptions};
    use crate::error::{Error, Result};
    use crate::health::LocalChecker;
    use crate::ring::{ConsistentRing, StaticNodes};
    use crate::router::{Cluster, RouterOptions};
    use crate::types::Shard;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::time::Duration;

    fn shards() -> Vec<Shard> {
        vec![
            Shard::new("alpha", "alpha:6379"),
            Shard::new("beta", "beta:6379"),
            Shard::new("gamma", "gamma:6379"),
        ]
    }

    async fn sharded_cache(backend: Arc<MemoryBackend>, failover: bool) -> Cache {
        let options = RouterOptions::new(
            Arc::new(StaticNodes(shards())),
            Arc::new(ConsistentRing::new(32)),
            Arc::new(LocalChecker::new(
                CheckerOptions::fast_for_tests(),
                backend.clone(),
            )),
            backend,
        )
        .with_failover(failover);
        let router = Cluster::new(options).await.unwrap();
        Cache::with_options(Arc::new(router), CacheOptions::default())
    }

    #[tokio::test]
    async fn string_roundtrip_through_the_cluster() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = sharded_cache(backend.clone(), false).await;

        let s1 = cache.set(&"basicTest", &"hello").await.unwrap();
        assert!(s1 > 0);
        assert_eq!(cache.loads(), 1);

        let (out, serial): (String, i64) = cache.get(&"basicTest").await.unwrap();
        assert_eq!(out, "hello");
        assert_eq!(serial, s1);
        assert_eq!(cache.hits(), 1);

        cache.del(&"basicTest").await.unwrap();
        let miss: Result<(String, i64)> = cache.get(&"basicTest").await;
        assert!(matches!(miss, Err(Error::NoKey)));
        assert_eq!(cache.misses(), 1);

        cache.shutdown().await;
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OuterKey {
        key: String,
        seq: u32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OuterValue {
        value: String,
        serial: i64,
    }

    #[tokio::test]
    async fn structured_roundtrip_through_the_cluster() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = sharded_cache(backend.clone(), false).await;

        let key = OuterKey {
            key: "okey".into(),
            seq: 999,
        };
        let value = OuterValue {
            value: "oval".into(),
            serial: 12345,
        };

        let s1 = cache.set(&key, &value).await.unwrap();
        let (out, serial): (OuterValue, i64) = cache.get(&key).await.unwrap();
        assert_eq!(out, value);
        assert_eq!(serial, s1);

        cache.del(&key).await.unwrap();
        let miss: Result<(OuterValue, i64)> = cache.get(&key).await;
        assert!(matches!(miss, Err(Error::NoKey)));

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn cas_conflict_through_the_cluster() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = sharded_cache(backend.clone(), false).await;

        let s1 = cache.set(&"k", &"one").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let s2 = cache.set(&"k", &"two").await.unwrap();
        assert!(s2 > s1);
        tokio::time::sleep(Duration::from_millis(2)).await;

        let refused = cache.check_and_set(&"k", &"three", s1).await;
        assert!(matches!(refused, Err(Error::SetFailed)));

        let (out, serial): (String, i64) = cache.get(&"k").await.unwrap();
        assert_eq!(out, "two");
        assert_eq!(serial, s2);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn writes_survive_a_dead_shard_with_failover() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_down("alpha:6379", true);
        let cache = sharded_cache(backend.clone(), true).await;

        // Every key must land somewhere alive and read back.
        for i in 0..20 {
            let key = format!("key-{}", i);
            cache.set(&key, &i).await.unwrap();
            let (out, _): (i32, i64) = cache.get(&key).await.unwrap();
            assert_eq!(out, i);
        }
        // The dead shard stored nothing.
        assert_eq!(backend.node("alpha:6379").entry_count(b"\"key-0\""), 0);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn all_shards_down_is_not_avail() {
        let backend = Arc::new(MemoryBackend::new());
        for shard in shards() {
            backend.set_down(&shard.addr, true);
        }
        let cache = sharded_cache(backend.clone(), true).await;

        let result = cache.set(&"k", &"v").await;
        assert!(matches!(result, Err(Error::NotAvail)));

        cache.shutdown().await;
    }
}
