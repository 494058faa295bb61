// End-to-end admission scenarios across resolver, quota, enforcer and queue

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tiergate::config::Config;
use tiergate::rate_limit::{
    Admission, AdmissionController, DecisionReason, EnforcerConfig, FairQueue, FairQueueConfig,
    InMemoryCounterStore, ManualClock, QuotaManager, RateLimitEnforcer, ResolverConfig,
    StaticTierLookup, Tier, TierLimits, TierRegistry, TierResolver,
};

const START_MS: u64 = 1_700_000_040_000;

struct Fixture {
    enforcer: Arc<RateLimitEnforcer>,
    lookup: Arc<StaticTierLookup>,
    clock: ManualClock,
}

fn fixture() -> Fixture {
    let clock = ManualClock::new(START_MS);
    let store = Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone())));
    let lookup = Arc::new(StaticTierLookup::new(Tier::Free));
    let resolver = Arc::new(TierResolver::new(
        lookup.clone(),
        Arc::new(TierRegistry::default()),
        Arc::new(clock.clone()),
        ResolverConfig::default(),
    ));
    let quota = QuotaManager::new(store, Arc::new(clock.clone()), Duration::from_secs(60), "itest");
    Fixture {
        enforcer: Arc::new(RateLimitEnforcer::new(resolver, quota, EnforcerConfig::default())),
        lookup,
        clock,
    }
}

#[tokio::test]
async fn free_tier_user_gets_quota_plus_burst_then_retry_after_window() {
    let f = fixture();

    let mut allowed = 0;
    let mut denials = Vec::new();
    for _ in 0..130 {
        let decision = f.enforcer.check("free-user").await;
        if decision.allowed {
            allowed += 1;
        } else {
            denials.push(decision);
        }
    }

    assert_eq!(allowed, 120);
    assert_eq!(denials.len(), 10);
    assert!(denials
        .iter()
        .all(|d| d.retry_after == Some(Duration::from_secs(60))
            && d.reason == DecisionReason::QuotaExhausted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_consumes_never_exceed_limit_plus_burst() {
    let clock = ManualClock::new(START_MS);
    let store = Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone())));
    let quota = QuotaManager::new(store, Arc::new(clock), Duration::from_secs(60), "itest");
    let limits = TierLimits::new(100, 20);

    let mut tasks = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let quota = quota.clone();
        tasks.push(tokio::spawn(async move {
            quota.consume("hot-user", &limits).await.unwrap()
        }));
    }

    let mut allowed = 0;
    let mut burst = 0;
    let mut denied = 0;
    for task in futures::future::join_all(tasks).await {
        let result = task.unwrap();
        match (result.allowed, result.used_burst) {
            (true, false) => allowed += 1,
            (true, true) => burst += 1,
            (false, _) => denied += 1,
        }
    }

    assert_eq!(allowed + burst, 120);
    assert_eq!(burst, 20);
    assert_eq!(denied, 880);
}

#[tokio::test]
async fn enterprise_admits_more_than_free_at_same_volume() {
    let f = fixture();
    f.lookup.assign("acme", Tier::Enterprise);

    let mut enterprise = 0;
    let mut free = 0;
    for _ in 0..1_000 {
        if f.enforcer.check("acme").await.allowed {
            enterprise += 1;
        }
        if f.enforcer.check("hobbyist").await.allowed {
            free += 1;
        }
    }

    assert!(enterprise > free);
    assert_eq!(enterprise, 1_000);
    assert_eq!(free, 120);
}

#[tokio::test]
async fn raising_free_limit_mid_window_lets_capped_user_continue() {
    let f = fixture();
    for _ in 0..100 {
        assert!(f.enforcer.check("capped").await.allowed);
    }
    let status = f.enforcer.status("capped").await.unwrap().1;
    assert_eq!(status.remaining, 0);

    f.enforcer
        .update_tier_limits(Tier::Free, TierLimits::new(200, 20))
        .unwrap();

    let mut regular = 0;
    loop {
        let decision = f.enforcer.check("capped").await;
        if !decision.allowed || decision.used_burst {
            break;
        }
        regular += 1;
    }
    assert_eq!(regular, 100);
}

#[tokio::test]
async fn tier_update_reaches_cached_bindings() {
    let f = fixture();
    f.enforcer.check("cached").await;
    let before = f.enforcer.resolver().resolve("cached").await;
    assert_eq!(before.limits, TierLimits::new(100, 20));

    f.enforcer
        .update_tier_limits(Tier::Free, TierLimits::new(300, 30))
        .unwrap();

    let after = f.enforcer.resolver().resolve("cached").await;
    assert_eq!(after.limits, TierLimits::new(300, 30));
    assert!(after.version > before.version);
}

#[tokio::test]
async fn lookup_outage_falls_back_to_free() {
    let f = fixture();
    f.lookup.assign("vip", Tier::Enterprise);
    f.lookup.set_failing(true);

    let decision = f.enforcer.check("vip").await;
    assert!(decision.allowed);
    assert_eq!(decision.tier, Tier::Free);

    // Fallback bindings expire quickly so recovery is picked up
    f.lookup.set_failing(false);
    f.clock.advance(Duration::from_secs(31));
    assert_eq!(f.enforcer.check("vip").await.tier, Tier::Enterprise);
}

#[tokio::test]
async fn fair_queue_serves_free_within_first_ten_dequeues() {
    let store = Arc::new(InMemoryCounterStore::new());
    let queue = FairQueue::new(
        store,
        Arc::new(ManualClock::new(START_MS)),
        Arc::new(TierRegistry::default()),
        FairQueueConfig::default(),
        "itest",
    );

    for (tier, count) in [
        (Tier::Enterprise, 2),
        (Tier::Mid, 3),
        (Tier::Early, 4),
        (Tier::Free, 5),
    ] {
        for i in 0..count {
            queue.enqueue("u", tier, json!(i), None).await.unwrap();
        }
    }

    let first_ten = queue.process(10).await.unwrap();
    assert_eq!(first_ten.len(), 10);
    assert!(first_ten.iter().any(|p| p.entry.tier == Tier::Free));
    assert_eq!(first_ten[0].entry.tier, Tier::Enterprise);
}

#[tokio::test]
async fn controller_queues_exhausted_user_and_drains_later() {
    let clock = ManualClock::new(START_MS);
    let controller = AdmissionController::from_config(
        &Config::default(),
        Arc::new(StaticTierLookup::new(Tier::Free)),
        Arc::new(InMemoryCounterStore::with_clock(Arc::new(clock.clone()))),
        Arc::new(clock.clone()),
    )
    .unwrap();

    for _ in 0..120 {
        assert!(controller.admit("busy", json!({}), None).await.unwrap().is_admitted());
    }
    let queued = controller
        .admit("busy", json!({"job": "report"}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let Admission::Queued { handle, .. } = queued else {
        panic!("expected the request to be queued");
    };

    clock.advance(Duration::from_secs(1));
    let drained = controller.queue().process(5).await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].entry.request_id, handle.request_id);
    assert_eq!(drained[0].waited, Duration::from_secs(1));
    controller.queue().complete(&handle.request_id).await.unwrap();
}
