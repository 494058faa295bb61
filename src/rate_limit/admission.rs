//! Admission Control
//!
//! Wires the enforcer and the fair queue into one entry point: admit when
//! quota allows, park the request in its tier's queue when quota is spent,
//! reject when the queue is full or the store is down.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::clock::{SharedClock, SystemClock};
use super::enforcer::{Decision, DecisionReason, RateLimitEnforcer};
use super::error::{RateLimitError, Result};
use super::fair_queue::{FairQueue, QueueHandle};
use super::quota::QuotaManager;
use super::resolver::{TierLookupService, TierResolver};
use super::scheduler::QueueScheduler;
use super::store::{InMemoryCounterStore, SharedStore};
use super::tier::TierRegistry;
use crate::config::{Config, StoreConfig};

/// What happened to a request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    /// Run now
    Admitted { decision: Decision },
    /// Quota spent; waiting in the tier queue
    Queued {
        decision: Decision,
        handle: QueueHandle,
    },
    /// Not admitted and not queued
    Rejected { decision: Decision },
}

impl Admission {
    pub fn decision(&self) -> &Decision {
        match self {
            Admission::Admitted { decision }
            | Admission::Queued { decision, .. }
            | Admission::Rejected { decision } => decision,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Admission controller
#[derive(Debug, Clone)]
pub struct AdmissionController {
    enforcer: Arc<RateLimitEnforcer>,
    queue: Arc<FairQueue>,
}

impl AdmissionController {
    pub fn new(enforcer: Arc<RateLimitEnforcer>, queue: Arc<FairQueue>) -> Self {
        Self { enforcer, queue }
    }

    /// Build every component from configuration over a shared store
    pub fn from_config(
        config: &Config,
        lookup: Arc<dyn TierLookupService>,
        store: SharedStore,
        clock: SharedClock,
    ) -> Result<Self> {
        let registry = Arc::new(TierRegistry::new(config.rate_limit.tier_table()?));

        let resolver = Arc::new(TierResolver::new(
            lookup,
            registry.clone(),
            clock.clone(),
            config.cache.resolver_config(),
        ));
        let quota = QuotaManager::new(
            store.clone(),
            clock.clone(),
            config.rate_limit.window(),
            &config.rate_limit.key_prefix,
        );
        let enforcer = Arc::new(RateLimitEnforcer::new(
            resolver,
            quota,
            config.rate_limit.enforcer_config(),
        ));
        let queue = Arc::new(FairQueue::new(
            store,
            clock,
            registry,
            config.queue.fair_queue_config(),
            &config.rate_limit.key_prefix,
        ));

        Ok(Self::new(enforcer, queue))
    }

    /// Admit, queue or reject one request
    pub async fn admit(
        &self,
        user_id: &str,
        payload: serde_json::Value,
        max_wait: Option<Duration>,
    ) -> Result<Admission> {
        let decision = self.enforcer.check(user_id).await;

        if decision.allowed {
            return Ok(Admission::Admitted { decision });
        }
        if decision.reason != DecisionReason::QuotaExhausted {
            return Ok(Admission::Rejected { decision });
        }

        match self
            .queue
            .enqueue(user_id, decision.tier, payload, max_wait)
            .await
        {
            Ok(handle) => Ok(Admission::Queued { decision, handle }),
            Err(RateLimitError::QueueFull { .. }) => Ok(Admission::Rejected { decision }),
            Err(e) => Err(e),
        }
    }

    /// Background drain over this controller's queue
    pub fn scheduler(&self, interval: Duration, batch_size: usize) -> QueueScheduler {
        QueueScheduler::new(self.queue.clone(), interval, batch_size)
    }

    pub fn enforcer(&self) -> &Arc<RateLimitEnforcer> {
        &self.enforcer
    }

    pub fn queue(&self) -> &Arc<FairQueue> {
        &self.queue
    }
}

/// Open the configured counter store
pub async fn open_store(config: &StoreConfig, clock: SharedClock) -> Result<SharedStore> {
    match config.backend.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(InMemoryCounterStore::with_clock(clock))),
        #[cfg(feature = "redis")]
        "redis" => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                RateLimitError::InvalidConfiguration("redis backend needs redis_url".to_string())
            })?;
            Ok(Arc::new(
                super::redis_store::RedisCounterStore::connect(url).await?,
            ))
        }
        #[cfg(not(feature = "redis"))]
        "redis" => Err(RateLimitError::InvalidConfiguration(
            "redis backend requires the `redis` feature".to_string(),
        )),
        other => Err(RateLimitError::InvalidConfiguration(format!(
            "unknown store backend: {}",
            other
        ))),
    }
}

/// Default wall clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;
    use crate::rate_limit::fair_queue::EntryState;
    use crate::rate_limit::resolver::StaticTierLookup;
    use crate::rate_limit::tier::Tier;
    use crate::rate_limit::TierConfig;
    use serde_json::json;

    fn controller(config: &Config) -> (AdmissionController, InMemoryCounterStore) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = InMemoryCounterStore::with_clock(Arc::new(clock.clone()));
        let controller = AdmissionController::from_config(
            config,
            Arc::new(StaticTierLookup::new(Tier::Free)),
            Arc::new(store.clone()),
            Arc::new(clock),
        )
        .unwrap();
        (controller, store)
    }

    fn small_free_tier() -> Config {
        let mut config = Config::default();
        config.rate_limit.tiers.insert(
            Tier::Free,
            TierConfig {
                requests_per_window: 2,
                burst_allowance: 1,
                weight: None,
            },
        );
        config.queue.max_depth = 2;
        config
    }

    #[tokio::test]
    async fn test_admit_then_queue_then_reject() {
        let (controller, _) = controller(&small_free_tier());

        for _ in 0..3 {
            let admission = controller.admit("u", json!({}), None).await.unwrap();
            assert!(admission.is_admitted());
        }

        let queued = controller.admit("u", json!({"n": 1}), None).await.unwrap();
        let Admission::Queued { handle, decision } = queued else {
            panic!("expected queued, got {:?}", queued);
        };
        assert_eq!(decision.tier, Tier::Free);
        assert_eq!(handle.queue_position, 1);
        assert_eq!(
            controller.queue().state(&handle.request_id).await.unwrap(),
            Some(EntryState::Enqueued)
        );

        controller.admit("u", json!({"n": 2}), None).await.unwrap();
        let rejected = controller.admit("u", json!({"n": 3}), None).await.unwrap();
        assert!(matches!(rejected, Admission::Rejected { .. }));
        assert_eq!(controller.queue().depth(Tier::Free).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_store_outage_rejects_without_queueing() {
        let (controller, store) = controller(&small_free_tier());
        store.set_available(false);

        let admission = controller.admit("u", json!({}), None).await.unwrap();
        let Admission::Rejected { decision } = admission else {
            panic!("expected rejection");
        };
        assert_eq!(decision.reason, DecisionReason::StoreUnavailable);
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_tiers() {
        let mut config = Config::default();
        config.rate_limit.tiers.insert(
            Tier::Mid,
            TierConfig {
                requests_per_window: 10,
                burst_allowance: 0,
                weight: None,
            },
        );
        let result = AdmissionController::from_config(
            &config,
            Arc::new(StaticTierLookup::new(Tier::Free)),
            Arc::new(InMemoryCounterStore::new()),
            system_clock(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_store_backends() {
        let store = open_store(&StoreConfig::default(), system_clock()).await;
        assert!(store.is_ok());

        let bogus = StoreConfig {
            backend: "etcd".to_string(),
            redis_url: None,
        };
        assert!(open_store(&bogus, system_clock()).await.is_err());
    }
}
