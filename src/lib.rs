//! tiergate
//!
//! Tiered rate limiting and weighted fair queuing for multi-tenant services:
//! tier resolution, fixed-window quotas with burst allowance, per-tier queues
//! and the Prometheus metrics around them.

pub mod config;
pub mod metrics;
pub mod metrics_server;
pub mod rate_limit;

pub use config::Config;
pub use rate_limit::{Admission, AdmissionController, Decision, RateLimitEnforcer, Tier};
