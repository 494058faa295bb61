//! Tier Resolution
//!
//! Maps a user to a tier and the tier's current limits. Bindings are cached
//! for a bounded TTL and checked against the registry's per-tier version on
//! every read. The cache is advisory: it decides which limits to apply, never
//! whether a request was counted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::clock::SharedClock;
use super::error::{RateLimitError, Result};
use super::tier::{Tier, TierLimits, TierRegistry};
use crate::metrics;

/// External source of truth for which tier a user is on
#[async_trait]
pub trait TierLookupService: Send + Sync + Debug {
    async fn get_tier(&self, user_id: &str) -> Result<Tier>;
}

/// In-memory lookup with a default tier, used for demos and tests
#[derive(Debug, Default)]
pub struct StaticTierLookup {
    assignments: std::sync::RwLock<HashMap<String, Tier>>,
    default_tier: Option<Tier>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    calls: AtomicU64,
}

impl StaticTierLookup {
    /// Unknown users resolve to `default_tier`
    pub fn new(default_tier: Tier) -> Self {
        Self {
            default_tier: Some(default_tier),
            ..Default::default()
        }
    }

    pub fn assign(&self, user_id: &str, tier: Tier) {
        self.assignments
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(user_id.to_string(), tier);
    }

    /// Make every lookup fail until turned off again
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every lookup, for timeout testing
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of lookups served (including failed ones)
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TierLookupService for StaticTierLookup {
    async fn get_tier(&self, user_id: &str) -> Result<Tier> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(RateLimitError::LookupFailure {
                user_id: user_id.to_string(),
                reason: "lookup service unavailable".to_string(),
            });
        }

        let assigned = self
            .assignments
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(user_id)
            .copied();

        assigned
            .or(self.default_tier)
            .ok_or_else(|| RateLimitError::LookupFailure {
                user_id: user_id.to_string(),
                reason: "unknown user".to_string(),
            })
    }
}

/// A user's resolved tier and the limits in force when it was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBinding {
    pub user_id: String,
    pub tier: Tier,
    pub limits: TierLimits,
    pub resolved_at: DateTime<Utc>,
    /// Registry version of `tier` the limits were read at
    pub version: u64,
    /// Lookup failed and the lowest tier was assumed
    pub fallback: bool,
}

#[derive(Debug, Clone)]
struct CachedBinding {
    binding: TierBinding,
    expires_at_ms: u64,
}

type InFlightMap = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Membership in a user's lookup gate; the last member out removes it
struct InFlight<'a> {
    map: &'a InFlightMap,
    user_id: &'a str,
    gate: Arc<Mutex<()>>,
}

impl<'a> InFlight<'a> {
    fn join(map: &'a InFlightMap, user_id: &'a str) -> Self {
        let gate = map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self { map, user_id, gate }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only handed out under the map lock, so the count cannot grow here
        let last = map.get(self.user_id).is_some_and(|gate| {
            Arc::ptr_eq(gate, &self.gate) && Arc::strong_count(&self.gate) == 2
        });
        if last {
            map.remove(self.user_id);
        }
    }
}

/// Resolver timing knobs
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// How long a successful lookup is trusted
    pub ttl: Duration,
    /// How long a fallback binding is trusted
    pub fallback_ttl: Duration,
    /// Per-attempt lookup timeout
    pub lookup_timeout: Duration,
    /// Base delay before the single retry
    pub retry_delay: Duration,
    /// Minimum time between sweeps of expired or stale bindings
    pub sweep_interval: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            fallback_ttl: Duration::from_secs(30),
            lookup_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub hits: u64,
    pub misses: u64,
    pub lookup_failures: u64,
    pub fallbacks: u64,
}

/// Tier resolver with a TTL cache
#[derive(Debug)]
pub struct TierResolver {
    lookup: Arc<dyn TierLookupService>,
    registry: Arc<TierRegistry>,
    clock: SharedClock,
    config: ResolverConfig,
    cache: RwLock<HashMap<String, CachedBinding>>,
    in_flight: InFlightMap,
    next_sweep_ms: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    lookup_failures: AtomicU64,
    fallbacks: AtomicU64,
}

impl TierResolver {
    pub fn new(
        lookup: Arc<dyn TierLookupService>,
        registry: Arc<TierRegistry>,
        clock: SharedClock,
        config: ResolverConfig,
    ) -> Self {
        Self {
            lookup,
            registry,
            clock,
            config,
            cache: RwLock::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            next_sweep_ms: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lookup_failures: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Resolve a user's tier binding.
    ///
    /// Never fails: if the lookup service is down after one retry the user is
    /// bound to the lowest-privilege tier.
    pub async fn resolve(&self, user_id: &str) -> TierBinding {
        if let Some(binding) = self.cached(user_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::TIER_CACHE_TOTAL.with_label_values(&["hit"]).inc();
            return binding;
        }

        // One lookup per user at a time; late arrivals reuse its result
        let flight = InFlight::join(&self.in_flight, user_id);
        let _guard = flight.gate.lock().await;

        if let Some(binding) = self.cached(user_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::TIER_CACHE_TOTAL.with_label_values(&["hit"]).inc();
            return binding;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::TIER_CACHE_TOTAL.with_label_values(&["miss"]).inc();

        let (tier, fallback) = match self.lookup_with_retry(user_id).await {
            Ok(tier) => (tier, false),
            Err(e) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    user_id,
                    error = %e,
                    "Tier lookup failed, assuming {}",
                    Tier::LOWEST
                );
                (Tier::LOWEST, true)
            }
        };

        // Version first: a concurrent update then makes this binding stale
        // rather than pairing the new version with old limits.
        let version = self.registry.version(tier);
        let limits = self.registry.limits(tier);
        let now = self.clock.now_ms();
        let binding = TierBinding {
            user_id: user_id.to_string(),
            tier,
            limits,
            resolved_at: DateTime::<Utc>::from_timestamp_millis(now as i64).unwrap_or_default(),
            version,
            fallback,
        };

        let ttl = if fallback {
            self.config.fallback_ttl
        } else {
            self.config.ttl
        };
        {
            let mut cache = self.cache.write().await;
            if now >= self.next_sweep_ms.load(Ordering::Relaxed) {
                self.sweep(&mut cache, now);
            }
            cache.insert(
                user_id.to_string(),
                CachedBinding {
                    binding: binding.clone(),
                    expires_at_ms: now + ttl.as_millis() as u64,
                },
            );
        }

        tracing::debug!(user_id, tier = %tier, fallback, "Resolved tier");
        binding
    }

    fn is_fresh(&self, entry: &CachedBinding, now: u64) -> bool {
        entry.expires_at_ms > now
            && entry.binding.version == self.registry.version(entry.binding.tier)
    }

    fn sweep(&self, cache: &mut HashMap<String, CachedBinding>, now: u64) -> usize {
        let before = cache.len();
        cache.retain(|_, entry| self.is_fresh(entry, now));
        self.next_sweep_ms.store(
            now + self.config.sweep_interval.as_millis() as u64,
            Ordering::Relaxed,
        );
        let swept = before - cache.len();
        if swept > 0 {
            tracing::debug!(swept, "Swept stale tier bindings");
        }
        swept
    }

    async fn cached(&self, user_id: &str) -> Option<TierBinding> {
        let now = self.clock.now_ms();
        {
            let cache = self.cache.read().await;
            let entry = cache.get(user_id)?;
            if self.is_fresh(entry, now) {
                return Some(entry.binding.clone());
            }
        }

        // Stale: drop it unless a fresh binding replaced it meanwhile
        let mut cache = self.cache.write().await;
        if cache.get(user_id).is_some_and(|entry| !self.is_fresh(entry, now)) {
            cache.remove(user_id);
        }
        None
    }

    async fn lookup_once(&self, user_id: &str) -> Result<Tier> {
        let outcome = tokio::time::timeout(self.config.lookup_timeout, self.lookup.get_tier(user_id)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::LookupTimeout(
                self.config.lookup_timeout.as_millis() as u64,
            )),
        };
        let label = if result.is_ok() { "success" } else { "failure" };
        metrics::TIER_LOOKUPS_TOTAL.with_label_values(&[label]).inc();
        if result.is_err() {
            self.lookup_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn lookup_with_retry(&self, user_id: &str) -> Result<Tier> {
        match self.lookup_once(user_id).await {
            Ok(tier) => Ok(tier),
            Err(first) => {
                tracing::debug!(user_id, error = %first, "Tier lookup failed, retrying once");
                let base = self.config.retry_delay.as_millis() as u64;
                let jitter = if base > 0 { fastrand::u64(0..=base / 2) } else { 0 };
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                self.lookup_once(user_id).await
            }
        }
    }

    /// Fresh cached binding, without consulting the lookup service
    pub async fn peek(&self, user_id: &str) -> Option<TierBinding> {
        self.cached(user_id).await
    }

    /// Drop one user's cached binding
    pub async fn invalidate(&self, user_id: &str) -> bool {
        self.cache.write().await.remove(user_id).is_some()
    }

    /// Mark every cached binding for `tier` stale
    pub fn invalidate_tier(&self, tier: Tier) {
        self.registry.bump_version(tier);
    }

    /// Drop every expired or stale binding now; returns how many were dropped
    pub async fn purge_stale(&self) -> usize {
        let now = self.clock.now_ms();
        let mut cache = self.cache.write().await;
        self.sweep(&mut cache, now)
    }

    /// Number of cached bindings that would still be served
    pub async fn cached_count(&self) -> usize {
        let now = self.clock.now_ms();
        let cache = self.cache.read().await;
        cache.values().filter(|c| self.is_fresh(c, now)).count()
    }

    /// Bindings held in memory, stale or not
    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Users with a lookup gate open
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }
}
