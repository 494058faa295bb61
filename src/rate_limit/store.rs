//! Counter Store
//!
//! The shared, authoritative store behind every admission decision. Quota
//! counters and queue lists live here; every mutating primitive is atomic at
//! the store level so that separate service instances sharing one backend
//! never read-then-write.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::clock::{SharedClock, SystemClock};
use super::error::{RateLimitError, Result};

/// Atomic key-value/counter/list store
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Increment `key` by one only if its current value is below `ceiling`.
    ///
    /// Returns the new value, or `None` when the counter is already at the
    /// ceiling. A newly created counter expires after `ttl`.
    async fn increment_below(&self, key: &str, ceiling: u64, ttl: Duration) -> Result<Option<u64>>;

    /// Current counter value (0 when absent or expired)
    async fn get(&self, key: &str) -> Result<u64>;

    /// Delete a counter, value or list
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append to a list unless it already holds `max_len` items.
    ///
    /// Returns the new length, or `None` when the list is full.
    async fn push_bounded(&self, list: &str, item: String, max_len: usize) -> Result<Option<usize>>;

    /// Pop the oldest list item
    async fn pop_front(&self, list: &str) -> Result<Option<String>>;

    /// Remove one occurrence of `item`; `false` if it was not present
    async fn remove(&self, list: &str, item: &str) -> Result<bool>;

    /// List length
    async fn len(&self, list: &str) -> Result<usize>;

    /// Snapshot of a list, oldest first
    async fn items(&self, list: &str) -> Result<Vec<String>>;

    /// Store a string value with expiry
    async fn set_value(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Read a string value
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Replace a string value only if it currently equals `expected`
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool>;
}

/// Shared store handle
pub type SharedStore = Arc<dyn CounterStore>;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    counters: HashMap<String, Expiring<u64>>,
    values: HashMap<String, Expiring<String>>,
    lists: HashMap<String, VecDeque<String>>,
    next_purge_ms: u64,
}

impl StoreState {
    fn purge(&mut self, now: u64) -> usize {
        let before = self.counters.len() + self.values.len();
        self.counters.retain(|_, c| c.expires_at_ms > now);
        self.values.retain(|_, v| v.expires_at_ms > now);
        before - (self.counters.len() + self.values.len())
    }
}

/// How often writes sweep expired keys out of the in-memory maps
const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// In-process store.
///
/// All mutation goes through one async mutex, which makes every primitive
/// atomic for tasks in this process. Use a networked store when several
/// service instances must share counters.
///
/// Expired counters and values are dropped by a sweep that runs on write at
/// most once per purge interval; lists are dropped once emptied.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    state: Arc<Mutex<StoreState>>,
    clock: SharedClock,
    available: Arc<AtomicBool>,
    purge_interval: Duration,
}

impl InMemoryCounterStore {
    /// Create a store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires keys against `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
            available: Arc::new(AtomicBool::new(true)),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }

    /// Sweep expired keys on write at most once per `interval`
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Simulate the backend going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RateLimitError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    fn deadline(&self, ttl: Duration) -> u64 {
        self.clock.now_ms() + ttl.as_millis() as u64
    }

    fn purge_if_due(&self, state: &mut StoreState, now: u64) {
        if now < state.next_purge_ms {
            return;
        }
        let purged = state.purge(now);
        state.next_purge_ms = now + self.purge_interval.as_millis() as u64;
        if purged > 0 {
            tracing::trace!(purged, "Purged expired store keys");
        }
    }

    /// Drop expired counters and values now; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        self.state.lock().await.purge(now)
    }

    /// Keys held in memory, expired or not
    pub async fn key_count(&self) -> usize {
        let state = self.state.lock().await;
        state.counters.len() + state.values.len() + state.lists.len()
    }

    /// Number of live counters
    pub async fn counter_count(&self) -> usize {
        let now = self.clock.now_ms();
        let state = self.state.lock().await;
        state
            .counters
            .values()
            .filter(|c| c.expires_at_ms > now)
            .count()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_below(&self, key: &str, ceiling: u64, ttl: Duration) -> Result<Option<u64>> {
        self.ensure_available()?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        self.purge_if_due(&mut state, now);

        let current = match state.counters.get(key) {
            Some(c) if c.expires_at_ms > now => c.value,
            _ => 0,
        };
        if current >= ceiling {
            return Ok(None);
        }

        if current == 0 {
            state.counters.insert(
                key.to_string(),
                Expiring {
                    value: 1,
                    expires_at_ms: self.deadline(ttl),
                },
            );
            return Ok(Some(1));
        }

        // Present and unexpired, checked above
        let counter = state
            .counters
            .get_mut(key)
            .ok_or_else(|| RateLimitError::StoreUnavailable(format!("counter {} vanished", key)))?;
        counter.value += 1;
        Ok(Some(counter.value))
    }

    async fn get(&self, key: &str) -> Result<u64> {
        self.ensure_available()?;
        let now = self.clock.now_ms();
        let state = self.state.lock().await;
        Ok(match state.counters.get(key) {
            Some(c) if c.expires_at_ms > now => c.value,
            _ => 0,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        state.counters.remove(key);
        state.values.remove(key);
        state.lists.remove(key);
        Ok(())
    }

    async fn push_bounded(&self, list: &str, item: String, max_len: usize) -> Result<Option<usize>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let queue = state.lists.entry(list.to_string()).or_default();
        if queue.len() >= max_len {
            return Ok(None);
        }
        queue.push_back(item);
        Ok(Some(queue.len()))
    }

    async fn pop_front(&self, list: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.lists.get_mut(list) else {
            return Ok(None);
        };
        let item = queue.pop_front();
        if queue.is_empty() {
            state.lists.remove(list);
        }
        Ok(item)
    }

    async fn remove(&self, list: &str, item: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.lists.get_mut(list) else {
            return Ok(false);
        };
        let Some(pos) = queue.iter().position(|i| i == item) else {
            return Ok(false);
        };
        queue.remove(pos);
        if queue.is_empty() {
            state.lists.remove(list);
        }
        Ok(true)
    }

    async fn len(&self, list: &str) -> Result<usize> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.lists.get(list).map_or(0, |q| q.len()))
    }

    async fn items(&self, list: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .lists
            .get(list)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_value(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        let now = self.clock.now_ms();
        let expires_at_ms = self.deadline(ttl);
        let mut state = self.state.lock().await;
        self.purge_if_due(&mut state, now);
        state.values.insert(
            key.to_string(),
            Expiring {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let now = self.clock.now_ms();
        let state = self.state.lock().await;
        Ok(match state.values.get(key) {
            Some(v) if v.expires_at_ms > now => Some(v.value.clone()),
            _ => None,
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool> {
        self.ensure_available()?;
        let now = self.clock.now_ms();
        let expires_at_ms = self.deadline(ttl);
        let mut state = self.state.lock().await;
        match state.values.get_mut(key) {
            Some(v) if v.expires_at_ms > now && v.value == expected => {
                v.value = value;
                v.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;

    fn store_with_clock() -> (InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (InMemoryCounterStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_increment_below_stops_at_ceiling() {
        let (store, _) = store_with_clock();
        let ttl = Duration::from_secs(60);

        for expected in 1..=3 {
            assert_eq!(store.increment_below("k", 3, ttl).await.unwrap(), Some(expected));
        }
        assert_eq!(store.increment_below("k", 3, ttl).await.unwrap(), None);
        assert_eq!(store.get("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_counter_expires() {
        let (store, clock) = store_with_clock();
        store
            .increment_below("k", 10, Duration::from_secs(5))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("k").await.unwrap(), 0);
        assert_eq!(store.counter_count().await, 0);

        // Expired counter restarts at 1 with a fresh ttl
        assert_eq!(
            store
                .increment_below("k", 10, Duration::from_secs(5))
                .await
                .unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();
        store.increment_below("a", 10, Duration::from_secs(1)).await.unwrap();
        store.increment_below("b", 10, Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.get("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_writes_sweep_expired_keys() {
        let (store, clock) = store_with_clock();
        let ttl = Duration::from_secs(60);

        // Window-scoped keys for many users over many windows
        for window in 0..50 {
            for user in 0..100 {
                let key = format!("quota:{}:{}", user, window);
                store.increment_below(&key, 10, ttl).await.unwrap();
            }
            store
                .set_value(&format!("state:{}", window), "ENQUEUED".into(), ttl)
                .await
                .unwrap();
            clock.advance(ttl);
        }

        // Only the last window's keys survive the sweeps
        assert!(store.key_count().await <= 101);

        store.increment_below("fresh", 10, ttl).await.unwrap();
        assert_eq!(store.key_count().await, 1);
        assert_eq!(store.counter_count().await, 1);
    }

    #[tokio::test]
    async fn test_purge_interval_limits_sweeps() {
        let (store, clock) = store_with_clock();
        let store = store.with_purge_interval(Duration::from_secs(10));
        store.increment_below("a", 10, Duration::from_secs(1)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        store.increment_below("b", 10, Duration::from_secs(60)).await.unwrap();
        // Expired `a` stays until the next sweep is due
        assert_eq!(store.key_count().await, 2);

        clock.advance(Duration::from_secs(10));
        store.increment_below("c", 10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.key_count().await, 2);
    }

    #[tokio::test]
    async fn test_drained_lists_are_dropped() {
        let store = InMemoryCounterStore::new();
        store.push_bounded("q", "a".into(), 10).await.unwrap();
        store.push_bounded("r", "b".into(), 10).await.unwrap();

        store.pop_front("q").await.unwrap();
        assert!(store.remove("r", "b").await.unwrap());
        assert_eq!(store.key_count().await, 0);
        assert_eq!(store.len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_push_bounded_and_pop() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.push_bounded("q", "a".into(), 2).await.unwrap(), Some(1));
        assert_eq!(store.push_bounded("q", "b".into(), 2).await.unwrap(), Some(2));
        assert_eq!(store.push_bounded("q", "c".into(), 2).await.unwrap(), None);

        assert_eq!(store.pop_front("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.len("q").await.unwrap(), 1);
        assert_eq!(store.pop_front("empty").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_from_list() {
        let store = InMemoryCounterStore::new();
        store.push_bounded("q", "a".into(), 10).await.unwrap();
        store.push_bounded("q", "b".into(), 10).await.unwrap();

        assert_eq!(store.items("q").await.unwrap(), vec!["a", "b"]);
        assert!(store.remove("q", "a").await.unwrap());
        assert!(!store.remove("q", "a").await.unwrap());
        assert_eq!(store.pop_front("q").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = InMemoryCounterStore::new();
        let ttl = Duration::from_secs(60);
        store.set_value("s", "one".into(), ttl).await.unwrap();

        assert!(!store.compare_and_set("s", "two", "three".into(), ttl).await.unwrap());
        assert!(store.compare_and_set("s", "one", "two".into(), ttl).await.unwrap());
        assert_eq!(store.get_value("s").await.unwrap().as_deref(), Some("two"));
        assert!(!store.compare_and_set("missing", "one", "x".into(), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryCounterStore::new();
        store.set_available(false);
        let err = store
            .increment_below("k", 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_store_failure());

        store.set_available(true);
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryCounterStore::new();
        store.increment_below("k", 5, Duration::from_secs(60)).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), 0);
    }
}
