//! Quota Accounting
//!
//! Fixed-window quota and burst counters per user. Counters are keyed by
//! window start, so a new window starts from zero without any reset job, and
//! stale keys fall out of the store by TTL.
//!
//! A fixed window lets a user spend a full allowance at the end of one window
//! and another at the start of the next. That boundary burst is accepted; a
//! sliding log or token bucket is the stricter alternative.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::clock::SharedClock;
use super::error::Result;
use super::store::SharedStore;
use super::tier::TierLimits;

/// Read-only view of a user's usage in the current window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// Regular requests admitted this window
    pub current_usage: u64,

    /// Burst requests admitted this window
    pub burst_used: u64,

    /// Regular requests left
    pub remaining: u64,

    /// Burst requests left
    pub burst_remaining: u64,

    /// Window start (Unix seconds)
    pub window_start: u64,

    /// Seconds until the window rolls over
    pub resets_in_secs: u64,
}

impl QuotaStatus {
    /// Whether a `consume` call could possibly succeed
    pub fn has_capacity(&self) -> bool {
        self.remaining > 0 || self.burst_remaining > 0
    }
}

/// Outcome of one atomic consume attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeResult {
    pub allowed: bool,

    /// Admitted out of the burst allowance
    pub used_burst: bool,

    pub remaining: u64,

    pub burst_remaining: u64,

    /// Set on denial
    pub retry_after: Option<Duration>,
}

impl ConsumeResult {
    fn regular(remaining: u64, burst_remaining: u64) -> Self {
        Self {
            allowed: true,
            used_burst: false,
            remaining,
            burst_remaining,
            retry_after: None,
        }
    }

    fn burst(burst_remaining: u64) -> Self {
        Self {
            allowed: true,
            used_burst: true,
            remaining: 0,
            burst_remaining,
            retry_after: None,
        }
    }

    fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            used_burst: false,
            remaining: 0,
            burst_remaining: 0,
            retry_after: Some(retry_after),
        }
    }
}

/// Quota manager over a shared counter store
#[derive(Debug, Clone)]
pub struct QuotaManager {
    store: SharedStore,
    clock: SharedClock,
    window: Duration,
    key_prefix: String,
}

impl QuotaManager {
    /// Create a manager with the given window length (whole seconds, at least one)
    pub fn new(store: SharedStore, clock: SharedClock, window: Duration, key_prefix: &str) -> Self {
        Self {
            store,
            clock,
            window: Duration::from_secs(window.as_secs().max(1)),
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Start of the current window and the time left in it
    fn current_window(&self) -> (u64, Duration) {
        let window_ms = self.window.as_millis() as u64;
        let now_ms = self.clock.now_ms();
        let start_ms = now_ms - now_ms % window_ms;
        let left_ms = (start_ms + window_ms - now_ms).max(1);
        (start_ms / 1000, Duration::from_millis(left_ms))
    }

    fn quota_key(&self, user_id: &str, window_start: u64) -> String {
        format!("{}:quota:{}:{}", self.key_prefix, user_id, window_start)
    }

    fn burst_key(&self, user_id: &str, window_start: u64) -> String {
        format!("{}:burst:{}:{}", self.key_prefix, user_id, window_start)
    }

    /// Current usage without mutating anything
    pub async fn get_status(&self, user_id: &str, limits: &TierLimits) -> Result<QuotaStatus> {
        let (window_start, left) = self.current_window();
        let current_usage = self.store.get(&self.quota_key(user_id, window_start)).await?;
        let burst_used = self.store.get(&self.burst_key(user_id, window_start)).await?;

        Ok(QuotaStatus {
            current_usage,
            burst_used,
            remaining: limits.requests_per_window.saturating_sub(current_usage),
            burst_remaining: limits.burst_allowance.saturating_sub(burst_used),
            window_start,
            resets_in_secs: left.as_secs_f64().ceil() as u64,
        })
    }

    /// Admit one request if quota or burst allows.
    ///
    /// Regular quota is always tried first; burst is only touched once the
    /// regular counter is at its limit. Both steps are single store-side
    /// check-and-increment operations.
    pub async fn consume(&self, user_id: &str, limits: &TierLimits) -> Result<ConsumeResult> {
        let (window_start, left) = self.current_window();

        let regular = self
            .store
            .increment_below(
                &self.quota_key(user_id, window_start),
                limits.requests_per_window,
                left,
            )
            .await?;

        if let Some(count) = regular {
            let burst_used = self.store.get(&self.burst_key(user_id, window_start)).await?;
            return Ok(ConsumeResult::regular(
                limits.requests_per_window.saturating_sub(count),
                limits.burst_allowance.saturating_sub(burst_used),
            ));
        }

        let burst = self
            .store
            .increment_below(
                &self.burst_key(user_id, window_start),
                limits.burst_allowance,
                left,
            )
            .await?;

        match burst {
            Some(count) => {
                tracing::debug!(user_id, burst_used = count, "Admitted from burst allowance");
                Ok(ConsumeResult::burst(limits.burst_allowance.saturating_sub(count)))
            }
            None => Ok(ConsumeResult::denied(self.window)),
        }
    }

    /// Clear a user's counters for the current window
    pub async fn reset(&self, user_id: &str) -> Result<()> {
        let (window_start, _) = self.current_window();
        self.store.delete(&self.quota_key(user_id, window_start)).await?;
        self.store.delete(&self.burst_key(user_id, window_start)).await?;
        tracing::info!(user_id, "Reset quota counters");
        Ok(())
    }
}
