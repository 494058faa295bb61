#![cfg(feature = "redis")]

// Runs only when REDIS_URL points at a reachable server

use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tiergate::rate_limit::{
    CounterStore, EntryState, FairQueue, FairQueueConfig, QuotaManager, RedisCounterStore,
    SystemClock, Tier, TierLimits, TierRegistry,
};

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

fn unique_prefix() -> String {
    format!("tiergate_test_{}", uuid::Uuid::new_v4().simple())
}

#[test]
fn increment_below_stops_at_ceiling() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let store = RedisCounterStore::connect(&url).await.unwrap();
        let key = format!("{}:counter", unique_prefix());
        let ttl = Duration::from_secs(30);

        assert_eq!(store.increment_below(&key, 2, ttl).await.unwrap(), Some(1));
        assert_eq!(store.increment_below(&key, 2, ttl).await.unwrap(), Some(2));
        assert_eq!(store.increment_below(&key, 2, ttl).await.unwrap(), None);
        assert_eq!(store.get(&key).await.unwrap(), 2);

        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), 0);
    });
}

#[test]
fn concurrent_consumes_are_exact_across_connections() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let prefix = unique_prefix();
        let limits = TierLimits::new(100, 20);

        let mut managers = Vec::new();
        for _ in 0..4 {
            let store = Arc::new(RedisCounterStore::connect(&url).await.unwrap());
            managers.push(QuotaManager::new(
                store,
                Arc::new(SystemClock),
                Duration::from_secs(3_600),
                &prefix,
            ));
        }

        let mut tasks = Vec::new();
        for i in 0..400 {
            let manager = managers[i % managers.len()].clone();
            tasks.push(tokio::spawn(async move {
                manager.consume("shared", &limits).await.unwrap().allowed
            }));
        }

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 120);
    });
}

#[test]
fn fair_queue_lifecycle_over_redis() {
    let Some(url) = redis_url() else {
        return;
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let store = Arc::new(RedisCounterStore::connect(&url).await.unwrap());
        let queue = FairQueue::new(
            store,
            Arc::new(SystemClock),
            Arc::new(TierRegistry::default()),
            FairQueueConfig {
                max_depth: 2,
                ..FairQueueConfig::default()
            },
            &unique_prefix(),
        );

        let first = queue.enqueue("a", Tier::Mid, json!(1), None).await.unwrap();
        let second = queue.enqueue("b", Tier::Mid, json!(2), None).await.unwrap();
        assert!(queue.enqueue("c", Tier::Mid, json!(3), None).await.is_err());

        queue.cancel(&second.request_id).await.unwrap();
        assert_eq!(
            queue.state(&second.request_id).await.unwrap(),
            Some(EntryState::Cancelled)
        );

        let drained = queue.process(10).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].entry.request_id, first.request_id);

        queue.complete(&first.request_id).await.unwrap();
        assert!(queue.complete(&first.request_id).await.is_err());
    });
}
