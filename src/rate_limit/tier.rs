//! Tier Types and Definition Registry
//!
//! Tiers are a closed set with a per-tier definition table. The table lives in
//! a [`TierRegistry`] that is owned by whoever builds the enforcer and swapped
//! atomically on update.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::error::{RateLimitError, Result};

/// Subscription tiers, lowest privilege first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Free tier
    Free,
    /// Early-adopter tier
    Early,
    /// Mid tier
    Mid,
    /// Enterprise tier
    Enterprise,
}

impl Tier {
    /// All tiers, lowest privilege first
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Early, Tier::Mid, Tier::Enterprise];

    /// All tiers in descending drain priority
    pub const BY_PRIORITY: [Tier; 4] = [Tier::Enterprise, Tier::Mid, Tier::Early, Tier::Free];

    /// Tier assigned when nothing better is known
    pub const LOWEST: Tier = Tier::Free;

    /// Stable table index
    pub fn index(&self) -> usize {
        match self {
            Tier::Free => 0,
            Tier::Early => 1,
            Tier::Mid => 2,
            Tier::Enterprise => 3,
        }
    }

    /// Lowercase name used in keys, config and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Early => "early",
            Tier::Mid => "mid",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Built-in definition for this tier
    pub fn default_definition(&self) -> TierDefinition {
        let (requests_per_window, burst_allowance, weight) = match self {
            Tier::Free => (100, 20, 1),
            Tier::Early => (500, 100, 2),
            Tier::Mid => (2_000, 400, 3),
            Tier::Enterprise => (10_000, 2_000, 4),
        };
        TierDefinition {
            tier: *self,
            limits: TierLimits::new(requests_per_window, burst_allowance),
            weight,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "early" => Ok(Tier::Early),
            "mid" => Ok(Tier::Mid),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(RateLimitError::InvalidConfiguration(format!(
                "Unknown tier: {}",
                other
            ))),
        }
    }
}

/// Per-window request limits for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Regular requests permitted per window
    pub requests_per_window: u64,

    /// Extra requests permitted once the regular quota is exhausted
    pub burst_allowance: u64,
}

impl TierLimits {
    pub fn new(requests_per_window: u64, burst_allowance: u64) -> Self {
        Self {
            requests_per_window,
            burst_allowance,
        }
    }

    /// Reject non-positive values
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_window == 0 {
            return Err(RateLimitError::InvalidConfiguration(
                "requests_per_window must be > 0".to_string(),
            ));
        }
        if self.burst_allowance == 0 {
            return Err(RateLimitError::InvalidConfiguration(
                "burst_allowance must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Hard ceiling on admissions per window
    pub fn ceiling(&self) -> u64 {
        self.requests_per_window + self.burst_allowance
    }
}

/// Full definition of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDefinition {
    pub tier: Tier,
    pub limits: TierLimits,
    /// Items drained per weighted round-robin pass
    pub weight: u32,
}

/// Immutable snapshot of every tier definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    definitions: [TierDefinition; 4],
}

impl TierTable {
    /// Build a table from explicit definitions, falling back to built-ins
    pub fn from_definitions(definitions: impl IntoIterator<Item = TierDefinition>) -> Result<Self> {
        let mut table = Self::default();
        for definition in definitions {
            definition.limits.validate()?;
            if definition.weight == 0 {
                return Err(RateLimitError::InvalidConfiguration(format!(
                    "weight for tier {} must be > 0",
                    definition.tier
                )));
            }
            table.definitions[definition.tier.index()] = definition;
        }
        Ok(table)
    }

    pub fn get(&self, tier: Tier) -> &TierDefinition {
        &self.definitions[tier.index()]
    }

    pub fn limits(&self, tier: Tier) -> TierLimits {
        self.get(tier).limits
    }

    pub fn weight(&self, tier: Tier) -> u32 {
        self.get(tier).weight
    }

    /// Sum of all drain weights (length of one full round-robin pass)
    pub fn total_weight(&self) -> u32 {
        self.definitions.iter().map(|d| d.weight).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TierDefinition> {
        self.definitions.iter()
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            definitions: Tier::ALL.map(|t| t.default_definition()),
        }
    }
}

/// Owned, injectable tier configuration with atomic snapshot swap.
///
/// Each tier carries a version counter; anything that cached limits for a
/// tier compares its recorded version on read instead of scanning keys.
#[derive(Debug)]
pub struct TierRegistry {
    table: RwLock<Arc<TierTable>>,
    versions: [AtomicU64; 4],
}

impl TierRegistry {
    pub fn new(table: TierTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            versions: Default::default(),
        }
    }

    /// Current snapshot; callers keep evaluating against it even if it is swapped
    pub fn snapshot(&self) -> Arc<TierTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn limits(&self, tier: Tier) -> TierLimits {
        self.snapshot().limits(tier)
    }

    /// Version of a tier's definition, bumped on every change
    pub fn version(&self, tier: Tier) -> u64 {
        self.versions[tier.index()].load(Ordering::Acquire)
    }

    /// Invalidate everything cached for a tier without changing its limits
    pub fn bump_version(&self, tier: Tier) -> u64 {
        self.versions[tier.index()].fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Swap in new limits for one tier.
    ///
    /// Returns `Ok(false)` when the limits are unchanged. Invalid limits leave
    /// the current table untouched.
    pub fn update_limits(&self, tier: Tier, limits: TierLimits) -> Result<bool> {
        limits.validate()?;

        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if guard.limits(tier) == limits {
            return Ok(false);
        }

        let mut next = (**guard).clone();
        next.definitions[tier.index()].limits = limits;
        *guard = Arc::new(next);
        // Version bump happens under the write lock so a reader never sees the
        // new version paired with the old table.
        self.bump_version(tier);
        Ok(true)
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::new(TierTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parse_and_display() {
        assert_eq!("Enterprise".parse::<Tier>().unwrap(), Tier::Enterprise);
        assert_eq!(" free ".parse::<Tier>().unwrap(), Tier::Free);
        assert!("platinum".parse::<Tier>().is_err());
        assert_eq!(Tier::Mid.to_string(), "mid");
    }

    #[test]
    fn test_priority_order() {
        assert_eq!(Tier::BY_PRIORITY[0], Tier::Enterprise);
        assert_eq!(Tier::BY_PRIORITY[3], Tier::LOWEST);
        assert!(Tier::Enterprise > Tier::Free);
    }

    #[test]
    fn test_default_table() {
        let table = TierTable::default();
        assert_eq!(table.limits(Tier::Free), TierLimits::new(100, 20));
        assert_eq!(table.limits(Tier::Enterprise), TierLimits::new(10_000, 2_000));
        assert_eq!(table.total_weight(), 10);
    }

    #[test]
    fn test_limits_validation() {
        assert!(TierLimits::new(0, 10).validate().is_err());
        assert!(TierLimits::new(10, 0).validate().is_err());
        assert!(TierLimits::new(10, 1).validate().is_ok());
        assert_eq!(TierLimits::new(100, 20).ceiling(), 120);
    }

    #[test]
    fn test_table_rejects_zero_weight() {
        let mut def = Tier::Free.default_definition();
        def.weight = 0;
        assert!(TierTable::from_definitions([def]).is_err());
    }

    #[test]
    fn test_registry_update_swaps_snapshot() {
        let registry = TierRegistry::default();
        let before = registry.snapshot();

        assert!(registry
            .update_limits(Tier::Free, TierLimits::new(200, 20))
            .unwrap());

        // Old snapshot is unchanged; new readers see the update
        assert_eq!(before.limits(Tier::Free).requests_per_window, 100);
        assert_eq!(registry.limits(Tier::Free).requests_per_window, 200);
        assert_eq!(registry.version(Tier::Free), 1);
        assert_eq!(registry.version(Tier::Mid), 0);
    }

    #[test]
    fn test_registry_update_same_limits_is_noop() {
        let registry = TierRegistry::default();
        assert!(!registry
            .update_limits(Tier::Free, TierLimits::new(100, 20))
            .unwrap());
        assert_eq!(registry.version(Tier::Free), 0);
    }

    #[test]
    fn test_registry_invalid_update_retains_previous() {
        let registry = TierRegistry::default();
        let result = registry.update_limits(Tier::Free, TierLimits::new(0, 20));
        assert!(matches!(
            result,
            Err(RateLimitError::InvalidConfiguration(_))
        ));
        assert_eq!(registry.limits(Tier::Free), TierLimits::new(100, 20));
        assert_eq!(registry.version(Tier::Free), 0);
    }
}
