//! Background Queue Drain
//!
//! Ticks on the configured drain interval, sweeps timed-out entries, drains a
//! batch from the [`FairQueue`] and forwards each entry to a channel. Request
//! handlers can still call `process` directly; both paths pop from the same
//! store so an entry is handed out once.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::fair_queue::{FairQueue, ProcessedEntry};

/// Periodic drain of a fair queue
#[derive(Debug, Clone)]
pub struct QueueScheduler {
    queue: Arc<FairQueue>,
    interval: Duration,
    batch_size: usize,
}

impl QueueScheduler {
    pub fn new(queue: Arc<FairQueue>, interval: Duration, batch_size: usize) -> Self {
        Self {
            queue,
            interval,
            batch_size,
        }
    }

    /// One drain tick; returns how many entries were forwarded.
    ///
    /// Channel slots are reserved before anything is dequeued, so a batch
    /// never exceeds the free capacity and entries stay queued when the
    /// receiver is gone. `None` means the receiver was dropped.
    pub async fn tick(&self, tx: &mpsc::Sender<ProcessedEntry>) -> Option<usize> {
        if let Err(e) = self.queue.expire_stale().await {
            tracing::error!("Queue expiry sweep failed: {}", e);
        }

        let mut permits = vec![tx.reserve().await.ok()?];
        while permits.len() < self.batch_size {
            match tx.try_reserve() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        let batch = match self.queue.process(permits.len()).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("Queue drain failed: {}", e);
                return Some(0);
            }
        };

        let count = batch.len();
        for (permit, entry) in permits.into_iter().zip(batch) {
            permit.send(entry);
        }
        Some(count)
    }

    /// Start the drain loop.
    ///
    /// The task ends when the receiving side of `tx` is dropped.
    pub fn spawn(self, tx: mpsc::Sender<ProcessedEntry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if self.tick(&tx).await.is_none() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            tracing::info!("Queue consumer gone, stopping scheduler");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::SystemClock;
    use crate::rate_limit::fair_queue::{EntryState, FairQueueConfig};
    use crate::rate_limit::store::InMemoryCounterStore;
    use crate::rate_limit::tier::{Tier, TierRegistry};
    use serde_json::json;

    fn queue() -> Arc<FairQueue> {
        Arc::new(FairQueue::new(
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(SystemClock),
            Arc::new(TierRegistry::default()),
            FairQueueConfig::default(),
            "sched",
        ))
    }

    #[tokio::test]
    async fn test_tick_forwards_batch() {
        let queue = queue();
        for i in 0..5 {
            queue.enqueue("u", Tier::Free, json!(i), None).await.unwrap();
        }
        let scheduler = QueueScheduler::new(queue.clone(), Duration::from_millis(10), 3);
        let (tx, mut rx) = mpsc::channel(16);

        assert_eq!(scheduler.tick(&tx).await, Some(3));
        assert_eq!(rx.recv().await.unwrap().entry.payload, json!(0));
        assert_eq!(queue.depth(Tier::Free).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tick_limited_by_channel_capacity() {
        let queue = queue();
        for i in 0..5 {
            queue.enqueue("u", Tier::Early, json!(i), None).await.unwrap();
        }
        let scheduler = QueueScheduler::new(queue.clone(), Duration::from_millis(10), 5);
        let (tx, mut rx) = mpsc::channel(2);

        assert_eq!(scheduler.tick(&tx).await, Some(2));
        assert_eq!(queue.depth(Tier::Early).await.unwrap(), 3);

        rx.recv().await.unwrap();
        assert_eq!(scheduler.tick(&tx).await, Some(1));
        assert_eq!(queue.depth(Tier::Early).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropped_receiver_leaves_entries_queued() {
        let queue = queue();
        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(queue.enqueue("u", Tier::Mid, json!(i), None).await.unwrap());
        }
        let scheduler = QueueScheduler::new(queue.clone(), Duration::from_millis(10), 5);
        let (tx, rx) = mpsc::channel(2);

        assert_eq!(scheduler.tick(&tx).await, Some(2));
        drop(rx);
        assert_eq!(scheduler.tick(&tx).await, None);

        assert_eq!(queue.depth(Tier::Mid).await.unwrap(), 3);
        for handle in &handles[2..] {
            assert_eq!(
                queue.state(&handle.request_id).await.unwrap(),
                Some(EntryState::Enqueued)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_scheduler_drains_and_stops() {
        let queue = queue();
        for i in 0..4 {
            queue.enqueue("u", Tier::Mid, json!(i), None).await.unwrap();
        }
        let (tx, mut rx) = mpsc::channel(16);
        let handle = QueueScheduler::new(queue.clone(), Duration::from_millis(50), 2).spawn(tx);

        let mut received = Vec::new();
        while received.len() < 4 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(queue.depth(Tier::Mid).await.unwrap(), 0);

        drop(rx);
        handle.await.unwrap();
    }
}
