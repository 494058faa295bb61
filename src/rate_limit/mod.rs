//! Tiered Rate Limiting and Fair Queuing
//!
//! Admission control for a multi-tenant service. Every request attributed to
//! a user is admitted from the tier's regular quota, admitted from its burst
//! allowance, parked in the tier's queue, or rejected.
//!
//! # Features
//!
//! - Closed set of subscription tiers with per-tier quota, burst and drain weight
//! - Fixed-window counters with store-side atomic check-and-increment
//! - Cached tier resolution that fails safe to the lowest tier
//! - Runtime tier limit updates that take effect on the next resolve
//! - Per-tier queues drained by weighted round robin
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Admission Controller                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────┐  ┌─────────────────────┐  │
//! │  │     Rate Limit Enforcer      │  │     Fair Queue      │  │
//! │  │  ┌──────────┐ ┌───────────┐  │  │  (weighted RR over  │  │
//! │  │  │  Tier    │ │  Quota    │  │  │   per-tier lists)   │  │
//! │  │  │ Resolver │ │  Manager  │  │  │                     │  │
//! │  │  └──────────┘ └───────────┘  │  └─────────────────────┘  │
//! │  └──────────────────────────────┘                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │         Counter Store (In-Memory or Redis)           │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod enforcer;
pub mod error;
pub mod fair_queue;
pub mod quota;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod tier;

pub use admission::{Admission, AdmissionController};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{RateLimitConfig, TierConfig};
pub use dashboard::{AdminAction, DashboardBuilder, DashboardData};
pub use enforcer::{Decision, DecisionReason, DecisionResponse, EnforcerConfig, RateLimitEnforcer};
pub use error::{RateLimitError, Result};
pub use fair_queue::{EntryState, FairQueue, FairQueueConfig, ProcessedEntry, QueueEntry, QueueHandle};
pub use quota::{ConsumeResult, QuotaManager, QuotaStatus};
#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;
pub use resolver::{ResolverConfig, StaticTierLookup, TierBinding, TierLookupService, TierResolver};
pub use scheduler::QueueScheduler;
pub use store::{CounterStore, InMemoryCounterStore, SharedStore};
pub use tier::{Tier, TierDefinition, TierLimits, TierRegistry, TierTable};
