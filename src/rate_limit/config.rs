//! Rate Limit Configuration
//!
//! Serializable admission settings and per-tier limit overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::enforcer::EnforcerConfig;
use super::error::Result;
use super::tier::{Tier, TierDefinition, TierLimits, TierTable};

/// Default quota window (seconds)
pub const DEFAULT_WINDOW_SECS: u64 = 60;
/// Default retry hint when the store is unreachable (seconds)
pub const DEFAULT_STORE_FAILURE_RETRY_SECS: u64 = 1;
/// Default store key prefix
pub const DEFAULT_KEY_PREFIX: &str = "tiergate";

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Quota window length in seconds
    pub window_secs: u64,

    /// Admit requests when the store is unreachable
    pub fail_open: bool,

    /// Retry hint returned with store-failure denials
    pub store_failure_retry_after_secs: u64,

    /// Prefix for every store key
    pub key_prefix: String,

    /// Users exempt from quotas
    pub exempt_users: Vec<String>,

    /// Per-tier overrides of the built-in definitions
    pub tiers: BTreeMap<Tier, TierConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: DEFAULT_WINDOW_SECS,
            fail_open: false,
            store_failure_retry_after_secs: DEFAULT_STORE_FAILURE_RETRY_SECS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            exempt_users: Vec::new(),
            tiers: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Quota window
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Built-in tier table with configured overrides applied
    pub fn tier_table(&self) -> Result<TierTable> {
        TierTable::from_definitions(self.tiers.iter().map(|(tier, cfg)| cfg.definition(*tier)))
    }

    /// Enforcer settings
    pub fn enforcer_config(&self) -> EnforcerConfig {
        EnforcerConfig {
            enabled: self.enabled,
            fail_open: self.fail_open,
            store_failure_retry_after: Duration::from_secs(self.store_failure_retry_after_secs),
            exempt_users: self.exempt_users.clone(),
        }
    }
}

/// Configured limits for one tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierConfig {
    pub requests_per_window: u64,
    pub burst_allowance: u64,
    /// Drain weight; defaults to the tier's built-in weight
    pub weight: Option<u32>,
}

impl TierConfig {
    fn definition(&self, tier: Tier) -> TierDefinition {
        TierDefinition {
            tier,
            limits: TierLimits::new(self.requests_per_window, self.burst_allowance),
            weight: self
                .weight
                .unwrap_or_else(|| tier.default_definition().weight),
        }
    }
}
