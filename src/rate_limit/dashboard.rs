//! Admin Dashboard Support
//!
//! Point-in-time view of tiers, queues and decision counters, plus the admin
//! actions an operator can apply at runtime.

use serde::{Deserialize, Serialize};

use super::admission::AdmissionController;
use super::enforcer::EnforcerStats;
use super::error::Result;
use super::resolver::ResolverStats;
use super::tier::{Tier, TierLimits};

/// Dashboard data for admin interface
#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    /// Timestamp of data generation
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// One row per tier, highest priority first
    pub tiers: Vec<TierSummary>,

    /// Decision counters since start
    pub decisions: EnforcerStats,

    /// Tier cache counters since start
    pub cache: ResolverStats,

    /// Bindings currently cached
    pub cached_bindings: usize,
}

impl DashboardData {
    /// Entries waiting across all tiers
    pub fn total_queued(&self) -> usize {
        self.tiers.iter().map(|t| t.queue_depth).sum()
    }
}

/// Current definition and backlog of one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierSummary {
    pub tier: Tier,
    pub limits: TierLimits,
    pub weight: u32,
    /// Bumped on every limit change
    pub version: u64,
    pub queue_depth: usize,
}

/// Dashboard builder for constructing dashboard data
pub struct DashboardBuilder {
    controller: AdmissionController,
}

impl DashboardBuilder {
    pub fn new(controller: AdmissionController) -> Self {
        Self { controller }
    }

    /// Build dashboard data
    pub async fn build(&self) -> Result<DashboardData> {
        let enforcer = self.controller.enforcer();
        let resolver = enforcer.resolver();
        let registry = enforcer.registry();
        let table = registry.snapshot();

        let mut tiers = Vec::with_capacity(Tier::BY_PRIORITY.len());
        for (tier, queue_depth) in self.controller.queue().depths().await? {
            let definition = table.get(tier);
            tiers.push(TierSummary {
                tier,
                limits: definition.limits,
                weight: definition.weight,
                version: registry.version(tier),
                queue_depth,
            });
        }

        Ok(DashboardData {
            timestamp: chrono::Utc::now(),
            tiers,
            decisions: enforcer.stats(),
            cache: resolver.stats(),
            cached_bindings: resolver.cached_count().await,
        })
    }
}

/// Admin action for adjusting limits at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminAction {
    /// Replace a tier's limits
    UpdateTierLimits {
        tier: Tier,
        requests_per_window: u64,
        burst_allowance: u64,
    },

    /// Clear a user's counters for the current window
    ResetUser { user_id: String },

    /// Drop a user's cached tier so the next request looks it up again
    InvalidateUser { user_id: String },

    /// Drop every cached binding of a tier
    InvalidateTier { tier: Tier },
}

impl AdminAction {
    /// Execute the admin action
    pub async fn execute(&self, controller: &AdmissionController) -> Result<()> {
        let enforcer = controller.enforcer();
        match self {
            AdminAction::UpdateTierLimits {
                tier,
                requests_per_window,
                burst_allowance,
            } => {
                enforcer.update_tier_limits(
                    *tier,
                    TierLimits::new(*requests_per_window, *burst_allowance),
                )?;
            }
            AdminAction::ResetUser { user_id } => {
                enforcer.reset_user(user_id).await?;
            }
            AdminAction::InvalidateUser { user_id } => {
                enforcer.resolver().invalidate(user_id).await;
            }
            AdminAction::InvalidateTier { tier } => {
                enforcer.resolver().invalidate_tier(*tier);
                let dropped = enforcer.resolver().purge_stale().await;
                tracing::debug!(tier = %tier, dropped, "Dropped stale tier bindings");
            }
        }
        tracing::info!(action = ?self, "Applied admin action");
        Ok(())
    }
}
