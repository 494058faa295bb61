//! Weighted Fair Queue
//!
//! One FIFO list per tier in the shared store, drained by weighted round
//! robin in descending tier priority. Each pass takes up to `weight` entries
//! from every tier, so a non-empty lower tier always gets at least one slot
//! per pass once the higher tiers have been served.
//!
//! Entry lifecycle:
//!
//! ```text
//! ENQUEUED ──► PROCESSING ──► COMPLETED
//!    │
//!    ├──► CANCELLED   (only before dequeue)
//!    └──► TIMED_OUT   (max wait elapsed before dequeue)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::clock::SharedClock;
use super::error::{RateLimitError, Result};
use super::store::SharedStore;
use super::tier::{Tier, TierRegistry};
use crate::metrics;

/// Queue entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    Enqueued,
    Processing,
    Completed,
    Cancelled,
    TimedOut,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Enqueued => "ENQUEUED",
            EntryState::Processing => "PROCESSING",
            EntryState::Completed => "COMPLETED",
            EntryState::Cancelled => "CANCELLED",
            EntryState::TimedOut => "TIMED_OUT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ENQUEUED" => Some(EntryState::Enqueued),
            "PROCESSING" => Some(EntryState::Processing),
            "COMPLETED" => Some(EntryState::Completed),
            "CANCELLED" => Some(EntryState::Cancelled),
            "TIMED_OUT" => Some(EntryState::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryState::Completed | EntryState::Cancelled | EntryState::TimedOut
        )
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub request_id: Uuid,
    pub user_id: String,
    pub tier: Tier,
    /// Unix milliseconds
    pub enqueued_at_ms: u64,
    /// Give up if not dequeued within this many milliseconds
    pub max_wait_ms: Option<u64>,
    /// Opaque to the queue
    pub payload: serde_json::Value,
}

impl QueueEntry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.max_wait_ms
            .is_some_and(|max| now_ms.saturating_sub(self.enqueued_at_ms) >= max)
    }
}

/// Returned to the caller on enqueue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHandle {
    pub request_id: Uuid,
    /// 1-based position within the tier's queue
    pub queue_position: usize,
    pub estimated_wait: Duration,
}

/// An entry handed out by [`FairQueue::process`], now PROCESSING
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedEntry {
    pub entry: QueueEntry,
    pub waited: Duration,
}

/// Queue limits and timing
#[derive(Debug, Clone)]
pub struct FairQueueConfig {
    /// Maximum entries per tier queue
    pub max_depth: usize,
    /// Expected time between drain passes, used for wait estimates
    pub drain_interval: Duration,
    /// Max wait applied when the caller gives none
    pub default_max_wait: Option<Duration>,
    /// How long entry and state records are kept
    pub record_ttl: Duration,
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 1_000,
            drain_interval: Duration::from_millis(100),
            default_max_wait: None,
            record_ttl: Duration::from_secs(3_600),
        }
    }
}

/// Per-tier queues with a weighted round-robin drain
#[derive(Debug, Clone)]
pub struct FairQueue {
    store: SharedStore,
    clock: SharedClock,
    registry: Arc<TierRegistry>,
    config: FairQueueConfig,
    key_prefix: String,
}

impl FairQueue {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        registry: Arc<TierRegistry>,
        config: FairQueueConfig,
        key_prefix: &str,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            config,
            key_prefix: key_prefix.to_string(),
        }
    }

    fn list_key(&self, tier: Tier) -> String {
        format!("{}:queue:{}", self.key_prefix, tier)
    }

    fn entry_key(&self, request_id: &Uuid) -> String {
        format!("{}:entry:{}", self.key_prefix, request_id)
    }

    fn state_key(&self, request_id: &Uuid) -> String {
        format!("{}:state:{}", self.key_prefix, request_id)
    }

    async fn set_state(&self, request_id: &Uuid, state: EntryState) -> Result<()> {
        self.store
            .set_value(
                &self.state_key(request_id),
                state.as_str().to_string(),
                self.config.record_ttl,
            )
            .await
    }

    /// Append work to its tier's queue without blocking.
    ///
    /// Fails with [`RateLimitError::QueueFull`] once the tier holds
    /// `max_depth` entries.
    pub async fn enqueue(
        &self,
        user_id: &str,
        tier: Tier,
        payload: serde_json::Value,
        max_wait: Option<Duration>,
    ) -> Result<QueueHandle> {
        let entry = QueueEntry {
            request_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            tier,
            enqueued_at_ms: self.clock.now_ms(),
            max_wait_ms: max_wait
                .or(self.config.default_max_wait)
                .map(|d| d.as_millis() as u64),
            payload,
        };
        let raw = serde_json::to_string(&entry)?;

        // Records first, so a concurrent drain never pops an entry without state
        self.store
            .set_value(&self.entry_key(&entry.request_id), raw.clone(), self.config.record_ttl)
            .await?;
        self.set_state(&entry.request_id, EntryState::Enqueued).await?;

        let pushed = self
            .store
            .push_bounded(&self.list_key(tier), raw, self.config.max_depth)
            .await?;

        let Some(queue_position) = pushed else {
            self.store.delete(&self.entry_key(&entry.request_id)).await?;
            self.store.delete(&self.state_key(&entry.request_id)).await?;
            metrics::QUEUE_ENTRIES_TOTAL
                .with_label_values(&[tier.as_str(), "rejected"])
                .inc();
            tracing::warn!(user_id, tier = %tier, "Queue full, rejecting entry");
            return Err(RateLimitError::QueueFull {
                tier,
                max_depth: self.config.max_depth,
            });
        };

        metrics::QUEUE_ENTRIES_TOTAL
            .with_label_values(&[tier.as_str(), "enqueued"])
            .inc();
        metrics::QUEUE_DEPTH
            .with_label_values(&[tier.as_str()])
            .set(queue_position as i64);

        let estimated_wait = self.estimate_wait(tier, queue_position);
        tracing::debug!(
            user_id,
            tier = %tier,
            request_id = %entry.request_id,
            queue_position,
            "Enqueued"
        );

        Ok(QueueHandle {
            request_id: entry.request_id,
            queue_position,
            estimated_wait,
        })
    }

    /// Passes needed to reach `position` at this tier's weight, times the pass interval
    fn estimate_wait(&self, tier: Tier, position: usize) -> Duration {
        let weight = self.registry.snapshot().weight(tier).max(1) as usize;
        let passes = position.div_ceil(weight) as u32;
        self.config.drain_interval * passes
    }

    /// Dequeue up to `max_items` entries by weighted round robin.
    ///
    /// Returned entries are PROCESSING. Entries found past their max wait are
    /// moved to TIMED_OUT and do not count against a tier's weight.
    pub async fn process(&self, max_items: usize) -> Result<Vec<ProcessedEntry>> {
        let table = self.registry.snapshot();
        let mut processed = Vec::new();

        'passes: while processed.len() < max_items {
            let mut progressed = false;

            for tier in Tier::BY_PRIORITY {
                let budget = (table.weight(tier) as usize).min(max_items - processed.len());
                let mut taken = 0;

                while taken < budget {
                    let Some(entry) = self.pop_live(tier).await? else {
                        break;
                    };
                    progressed = true;
                    taken += 1;
                    processed.push(entry);
                }

                if processed.len() >= max_items {
                    break 'passes;
                }
            }

            if !progressed {
                break;
            }
        }

        for tier in Tier::ALL {
            let depth = self.store.len(&self.list_key(tier)).await?;
            metrics::QUEUE_DEPTH
                .with_label_values(&[tier.as_str()])
                .set(depth as i64);
        }

        if !processed.is_empty() {
            tracing::info!(count = processed.len(), "Drained fair queue");
        }
        Ok(processed)
    }

    /// Pop the next entry of `tier` that has not timed out
    async fn pop_live(&self, tier: Tier) -> Result<Option<ProcessedEntry>> {
        let list = self.list_key(tier);
        loop {
            let Some(raw) = self.store.pop_front(&list).await? else {
                return Ok(None);
            };

            let entry: QueueEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(tier = %tier, error = %e, "Dropping unreadable queue entry");
                    continue;
                }
            };

            let now = self.clock.now_ms();
            if entry.is_expired(now) {
                self.set_state(&entry.request_id, EntryState::TimedOut).await?;
                metrics::QUEUE_ENTRIES_TOTAL
                    .with_label_values(&[tier.as_str(), "timed_out"])
                    .inc();
                tracing::debug!(request_id = %entry.request_id, "Queue entry timed out");
                continue;
            }

            self.set_state(&entry.request_id, EntryState::Processing).await?;
            let waited = Duration::from_millis(now.saturating_sub(entry.enqueued_at_ms));
            metrics::QUEUE_ENTRIES_TOTAL
                .with_label_values(&[tier.as_str(), "processed"])
                .inc();
            metrics::QUEUE_WAIT_SECONDS
                .with_label_values(&[tier.as_str()])
                .observe(waited.as_secs_f64());

            return Ok(Some(ProcessedEntry { entry, waited }));
        }
    }

    async fn load_entry(&self, request_id: &Uuid) -> Result<(QueueEntry, String)> {
        let raw = self
            .store
            .get_value(&self.entry_key(request_id))
            .await?
            .ok_or_else(|| RateLimitError::EntryNotFound(request_id.to_string()))?;
        let entry = serde_json::from_str(&raw)?;
        Ok((entry, raw))
    }

    /// Cancel an entry that has not been dequeued yet
    pub async fn cancel(&self, request_id: &Uuid) -> Result<()> {
        let (entry, raw) = self.load_entry(request_id).await?;

        if self.store.remove(&self.list_key(entry.tier), &raw).await? {
            self.set_state(request_id, EntryState::Cancelled).await?;
            metrics::QUEUE_ENTRIES_TOTAL
                .with_label_values(&[entry.tier.as_str(), "cancelled"])
                .inc();
            tracing::debug!(request_id = %request_id, "Queue entry cancelled");
            return Ok(());
        }

        let from = self
            .state(request_id)
            .await?
            .map_or_else(|| "UNKNOWN".to_string(), |s| s.to_string());
        Err(RateLimitError::InvalidTransition {
            from,
            to: EntryState::Cancelled.to_string(),
        })
    }

    /// Mark a dequeued entry as done
    pub async fn complete(&self, request_id: &Uuid) -> Result<()> {
        let key = self.state_key(request_id);
        let swapped = self
            .store
            .compare_and_set(
                &key,
                EntryState::Processing.as_str(),
                EntryState::Completed.as_str().to_string(),
                self.config.record_ttl,
            )
            .await?;
        if swapped {
            return Ok(());
        }

        match self.state(request_id).await? {
            None => Err(RateLimitError::EntryNotFound(request_id.to_string())),
            Some(state) => Err(RateLimitError::InvalidTransition {
                from: state.to_string(),
                to: EntryState::Completed.to_string(),
            }),
        }
    }

    /// Current state of an entry, `None` if unknown or its record expired
    pub async fn state(&self, request_id: &Uuid) -> Result<Option<EntryState>> {
        let raw = self.store.get_value(&self.state_key(request_id)).await?;
        Ok(raw.as_deref().and_then(EntryState::parse))
    }

    /// Remove every queued entry whose max wait has elapsed; returns how many
    pub async fn expire_stale(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut expired = 0;

        for tier in Tier::ALL {
            let list = self.list_key(tier);
            for raw in self.store.items(&list).await? {
                let Ok(entry) = serde_json::from_str::<QueueEntry>(&raw) else {
                    continue;
                };
                // Losing the removal race means a drain or cancel got there first
                if entry.is_expired(now) && self.store.remove(&list, &raw).await? {
                    self.set_state(&entry.request_id, EntryState::TimedOut).await?;
                    metrics::QUEUE_ENTRIES_TOTAL
                        .with_label_values(&[tier.as_str(), "timed_out"])
                        .inc();
                    expired += 1;
                }
            }
        }

        if expired > 0 {
            tracing::info!(expired, "Expired stale queue entries");
        }
        Ok(expired)
    }

    pub async fn depth(&self, tier: Tier) -> Result<usize> {
        self.store.len(&self.list_key(tier)).await
    }

    /// Depth of every tier queue, highest priority first
    pub async fn depths(&self) -> Result<Vec<(Tier, usize)>> {
        let mut depths = Vec::with_capacity(Tier::BY_PRIORITY.len());
        for tier in Tier::BY_PRIORITY {
            depths.push((tier, self.depth(tier).await?));
        }
        Ok(depths)
    }

    pub fn config(&self) -> &FairQueueConfig {
        &self.config
    }
}
