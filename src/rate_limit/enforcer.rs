//! Rate Limit Enforcer
//!
//! Single decision API over tier resolution and quota accounting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::error::{RateLimitError, Result};
use super::quota::{QuotaManager, QuotaStatus};
use super::resolver::{TierBinding, TierResolver};
use super::tier::{Tier, TierLimits, TierRegistry};
use crate::metrics;

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Admitted from the regular quota
    Quota,
    /// Admitted from the burst allowance
    Burst,
    /// Quota and burst both spent
    QuotaExhausted,
    /// Store unreachable, denied conservatively
    StoreUnavailable,
    /// Store unreachable, admitted because fail-open is configured
    FailOpen,
    /// User is exempt from limits
    Exempt,
    /// Rate limiting is switched off
    Disabled,
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request is allowed
    pub allowed: bool,

    pub tier: Tier,

    /// Usage after this decision
    pub quota_status: QuotaStatus,

    /// Admitted out of the burst allowance
    pub used_burst: bool,

    /// When to try again (if not allowed)
    pub retry_after: Option<Duration>,

    pub reason: DecisionReason,
}

impl Decision {
    fn admitted(tier: Tier, quota_status: QuotaStatus, reason: DecisionReason) -> Self {
        Self {
            allowed: true,
            tier,
            quota_status,
            used_burst: reason == DecisionReason::Burst,
            retry_after: None,
            reason,
        }
    }

    fn denied(
        tier: Tier,
        quota_status: QuotaStatus,
        retry_after: Duration,
        reason: DecisionReason,
    ) -> Self {
        Self {
            allowed: false,
            tier,
            quota_status,
            used_burst: false,
            retry_after: Some(retry_after),
            reason,
        }
    }

    /// Wire shape handed to the transport layer
    pub fn to_response(&self) -> DecisionResponse {
        DecisionResponse {
            allowed: self.allowed,
            tier: self.tier.to_string(),
            remaining: self.quota_status.remaining,
            burst_remaining: self.quota_status.burst_remaining,
            retry_after_seconds: self.retry_after.map(|d| d.as_secs_f64().ceil() as u64),
        }
    }

    /// HTTP status code for this decision
    pub fn status_code(&self) -> u16 {
        match (self.allowed, self.reason) {
            (true, _) => 200,
            (false, DecisionReason::StoreUnavailable) => 503,
            (false, _) => 429,
        }
    }
}

/// Public decision payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub allowed: bool,
    pub tier: String,
    pub remaining: u64,
    pub burst_remaining: u64,
    pub retry_after_seconds: Option<u64>,
}

/// Enforcer behaviour switches
#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    pub enabled: bool,
    /// Admit when the store is unreachable instead of denying
    pub fail_open: bool,
    /// Retry hint on store-failure denials
    pub store_failure_retry_after: Duration,
    /// Users that bypass quotas
    pub exempt_users: Vec<String>,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: false,
            store_failure_retry_after: Duration::from_secs(1),
            exempt_users: Vec::new(),
        }
    }
}

/// Aggregate decision counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnforcerStats {
    pub allowed: u64,
    pub burst: u64,
    pub denied: u64,
    pub errors: u64,
}

/// Rate limit enforcer
#[derive(Debug)]
pub struct RateLimitEnforcer {
    resolver: Arc<TierResolver>,
    quota: QuotaManager,
    config: EnforcerConfig,
    allowed: AtomicU64,
    burst: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
}

impl RateLimitEnforcer {
    pub fn new(resolver: Arc<TierResolver>, quota: QuotaManager, config: EnforcerConfig) -> Self {
        Self {
            resolver,
            quota,
            config,
            allowed: AtomicU64::new(0),
            burst: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Decide whether `user_id` may make one request now.
    ///
    /// Counts against the user's quota when the decision is `allowed`.
    /// Disabled mode and exempt users skip the tier lookup; their decision
    /// carries the cached tier, or the lowest tier when none is cached.
    pub async fn check(&self, user_id: &str) -> Decision {
        let bypass = if !self.config.enabled {
            Some(DecisionReason::Disabled)
        } else if self.config.exempt_users.iter().any(|u| u == user_id) {
            Some(DecisionReason::Exempt)
        } else {
            None
        };
        if let Some(reason) = bypass {
            let tier = self
                .resolver
                .peek(user_id)
                .await
                .map_or(Tier::LOWEST, |binding| binding.tier);
            return self.record(Decision::admitted(tier, QuotaStatus::default(), reason));
        }

        let binding = self.resolver.resolve(user_id).await;

        let decision = match self.evaluate(user_id, &binding).await {
            Ok(decision) => decision,
            Err(e) => self.store_failure(user_id, binding.tier, e),
        };

        tracing::debug!(
            user_id,
            tier = %decision.tier,
            allowed = decision.allowed,
            reason = ?decision.reason,
            "Rate limit decision"
        );
        self.record(decision)
    }

    async fn evaluate(&self, user_id: &str, binding: &TierBinding) -> Result<Decision> {
        let limits = binding.limits;
        let status = self.quota.get_status(user_id, &limits).await?;

        // Nothing left: skip the mutating round-trip
        if !status.has_capacity() {
            return Ok(Decision::denied(
                binding.tier,
                status,
                self.quota.window(),
                DecisionReason::QuotaExhausted,
            ));
        }

        let result = self.quota.consume(user_id, &limits).await?;
        if !result.allowed {
            let status = QuotaStatus {
                remaining: 0,
                burst_remaining: 0,
                ..status
            };
            return Ok(Decision::denied(
                binding.tier,
                status,
                result.retry_after.unwrap_or_else(|| self.quota.window()),
                DecisionReason::QuotaExhausted,
            ));
        }

        let status = if result.used_burst {
            QuotaStatus {
                current_usage: status.current_usage.max(limits.requests_per_window),
                burst_used: limits.burst_allowance - result.burst_remaining,
                remaining: 0,
                burst_remaining: result.burst_remaining,
                ..status
            }
        } else {
            QuotaStatus {
                current_usage: limits.requests_per_window - result.remaining,
                remaining: result.remaining,
                burst_remaining: result.burst_remaining,
                ..status
            }
        };

        let reason = if result.used_burst {
            DecisionReason::Burst
        } else {
            DecisionReason::Quota
        };
        Ok(Decision::admitted(binding.tier, status, reason))
    }

    fn store_failure(&self, user_id: &str, tier: Tier, error: RateLimitError) -> Decision {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::ADMISSION_DECISIONS_TOTAL
            .with_label_values(&["error"])
            .inc();

        if self.config.fail_open {
            tracing::warn!(user_id, error = %error, "Store unavailable, failing open");
            Decision::admitted(tier, QuotaStatus::default(), DecisionReason::FailOpen)
        } else {
            tracing::error!(user_id, error = %error, "Store unavailable, denying request");
            Decision::denied(
                tier,
                QuotaStatus::default(),
                self.config.store_failure_retry_after,
                DecisionReason::StoreUnavailable,
            )
        }
    }

    fn record(&self, decision: Decision) -> Decision {
        let outcome = match (decision.allowed, decision.used_burst) {
            (true, false) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                "allowed"
            }
            (true, true) => {
                self.burst.fetch_add(1, Ordering::Relaxed);
                "burst"
            }
            (false, _) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                "denied"
            }
        };
        metrics::ADMISSION_DECISIONS_TOTAL
            .with_label_values(&[outcome])
            .inc();
        decision
    }

    /// Read-only quota status for a user
    pub async fn status(&self, user_id: &str) -> Result<(TierBinding, QuotaStatus)> {
        let binding = self.resolver.resolve(user_id).await;
        let status = self.quota.get_status(user_id, &binding.limits).await?;
        Ok((binding, status))
    }

    /// Replace a tier's limits.
    ///
    /// Invalid limits are rejected and the current definition is kept. New
    /// resolves see the change at once; requests already holding the old
    /// limits finish against them.
    pub fn update_tier_limits(&self, tier: Tier, limits: TierLimits) -> Result<bool> {
        match self.registry().update_limits(tier, limits) {
            Ok(changed) => {
                if changed {
                    metrics::TIER_LIMIT_UPDATES_TOTAL.inc();
                    tracing::info!(
                        tier = %tier,
                        requests_per_window = limits.requests_per_window,
                        burst_allowance = limits.burst_allowance,
                        "Updated tier limits"
                    );
                }
                Ok(changed)
            }
            Err(e) => {
                tracing::warn!(tier = %tier, error = %e, "Rejected tier limit update");
                Err(e)
            }
        }
    }

    /// [`update_tier_limits`](Self::update_tier_limits) by tier name
    pub fn update_tier_limits_by_name(&self, tier: &str, limits: TierLimits) -> Result<bool> {
        self.update_tier_limits(tier.parse()?, limits)
    }

    /// Clear a user's counters for the current window
    pub async fn reset_user(&self, user_id: &str) -> Result<()> {
        self.quota.reset(user_id).await
    }

    pub fn stats(&self) -> EnforcerStats {
        EnforcerStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            burst: self.burst.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        self.resolver.registry()
    }

    pub fn resolver(&self) -> &Arc<TierResolver> {
        &self.resolver
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }
}
