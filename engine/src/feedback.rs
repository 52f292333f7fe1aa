//! Feedback recorder: applies execution outcomes and history records off the
//! request path
//!
//! Callers enqueue and return immediately. A single background worker drains
//! the queue, retrying statistic updates that hit a write conflict with
//! bounded exponential backoff. A full queue drops the event (counted and
//! logged) rather than blocking the translation that produced it.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedbackConfig;
use crate::error::StoreError;
use crate::history_log::HistoryStore;
use crate::metrics;
use crate::schema::{EntryId, ExecutionOutcome, HistoryRecord};
use crate::store::CacheEntryStore;

enum FeedbackEvent {
    History(HistoryRecord),
    Outcome {
        entry_id: EntryId,
        outcome: ExecutionOutcome,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackStats {
    pub enqueued: u64,
    pub outcomes_applied: u64,
    pub history_appended: u64,
    pub conflict_retries: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    outcomes_applied: AtomicU64,
    history_appended: AtomicU64,
    conflict_retries: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    base: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(16))
    }
}

pub struct FeedbackRecorder {
    tx: mpsc::Sender<FeedbackEvent>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl FeedbackRecorder {
    /// Start the background worker. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<dyn CacheEntryStore>,
        history: Arc<dyn HistoryStore>,
        config: &FeedbackConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let counters = Arc::new(Counters::default());
        let policy = RetryPolicy {
            max_retries: config.max_retries,
            base: config.retry_base(),
        };

        let worker = Worker {
            store,
            history,
            policy,
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(worker.run(rx, shutdown_rx));

        Self {
            tx,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
            counters,
        }
    }

    /// Queue a history record; never blocks
    pub fn record_history(&self, record: HistoryRecord) {
        self.enqueue(FeedbackEvent::History(record));
    }

    /// Queue an execution outcome for `entry_id`; never blocks
    pub fn record_outcome(&self, entry_id: EntryId, outcome: ExecutionOutcome) {
        self.enqueue(FeedbackEvent::Outcome { entry_id, outcome });
    }

    fn enqueue(&self, event: FeedbackEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::FEEDBACK_DROPPED_TOTAL.inc();
                warn!("feedback queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::FEEDBACK_DROPPED_TOTAL.inc();
                warn!("feedback recorder stopped, dropping event");
            }
        }
    }

    /// Wait until every event queued before this call has been processed
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(FeedbackEvent::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Drain the queue and stop the worker
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "feedback worker terminated abnormally");
            }
        }
    }

    pub fn stats(&self) -> FeedbackStats {
        let c = &self.counters;
        FeedbackStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            outcomes_applied: c.outcomes_applied.load(Ordering::Relaxed),
            history_appended: c.history_appended.load(Ordering::Relaxed),
            conflict_retries: c.conflict_retries.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    store: Arc<dyn CacheEntryStore>,
    history: Arc<dyn HistoryStore>,
    policy: RetryPolicy,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(
        self,
        mut rx: mpsc::Receiver<FeedbackEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    info!("feedback recorder received shutdown signal, draining queue");
                    rx.close();
                    while let Some(event) = rx.recv().await {
                        self.handle(event).await;
                    }
                    break;
                }
            }
        }
        info!("feedback recorder stopped");
    }

    async fn handle(&self, event: FeedbackEvent) {
        match event {
            FeedbackEvent::History(record) => self.append_history(record).await,
            FeedbackEvent::Outcome { entry_id, outcome } => {
                self.apply_outcome(entry_id, &outcome).await
            }
            FeedbackEvent::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    async fn append_history(&self, record: HistoryRecord) {
        let id = record.id;
        match self.history.append(record).await {
            Ok(()) => {
                self.counters.history_appended.fetch_add(1, Ordering::Relaxed);
                metrics::FEEDBACK_APPLIED_TOTAL
                    .with_label_values(&["history"])
                    .inc();
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::FEEDBACK_FAILED_TOTAL.inc();
                warn!(history_id = %id, error = %e, "failed to append history record");
            }
        }
    }

    async fn apply_outcome(&self, entry_id: EntryId, outcome: &ExecutionOutcome) {
        let mut attempt = 0;
        loop {
            match self.store.record_outcome(entry_id, outcome).await {
                Ok(stats) => {
                    self.counters.outcomes_applied.fetch_add(1, Ordering::Relaxed);
                    metrics::FEEDBACK_APPLIED_TOTAL
                        .with_label_values(&["outcome"])
                        .inc();
                    debug!(
                        entry_id,
                        success = outcome.success,
                        successes = stats.success_count,
                        failures = stats.failure_count,
                        "recorded execution outcome"
                    );
                    return;
                }
                Err(StoreError::Conflict(_)) if attempt < self.policy.max_retries => {
                    self.counters.conflict_retries.fetch_add(1, Ordering::Relaxed);
                    metrics::FEEDBACK_CONFLICT_RETRIES_TOTAL.inc();
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::FEEDBACK_FAILED_TOTAL.inc();
                    warn!(entry_id, attempts = attempt + 1, error = %e, "dropping execution outcome");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history_log::RingHistoryLog;
    use crate::schema::{CacheEntry, EntryStats, NewCacheEntry};
    use crate::store::MemoryCacheStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn config() -> FeedbackConfig {
        FeedbackConfig {
            queue_capacity: 64,
            max_retries: 3,
            retry_base_ms: 1,
        }
    }

    async fn seeded_store() -> (Arc<MemoryCacheStore>, EntryId) {
        let store = Arc::new(MemoryCacheStore::new(2));
        let id = store
            .put(NewCacheEntry {
                query_text: "cpu usage".into(),
                embedding: vec![1.0, 0.0],
                promql_template: "rate(process_cpu_seconds_total[5m])".into(),
            })
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_outcomes_and_history_are_applied() {
        let (store, id) = seeded_store().await;
        let history = Arc::new(RingHistoryLog::new(16));
        let recorder = FeedbackRecorder::spawn(store.clone(), history.clone(), &config());

        recorder.record_outcome(id, ExecutionOutcome::succeeded(40.0));
        recorder.record_outcome(id, ExecutionOutcome::failed(20.0, "timeout"));
        recorder.record_history(HistoryRecord::for_query("cpu usage", None));
        recorder.flush().await;

        let entry = store.get_by_id(id).await.unwrap();
        assert_eq!(entry.success_count, 1);
        assert_eq!(entry.failure_count, 1);
        assert!((entry.avg_execution_time_ms - 30.0).abs() < 1e-9);
        assert_eq!(history.len().await.unwrap(), 1);

        let stats = recorder.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.outcomes_applied, 2);
        assert_eq!(stats.history_appended, 1);
        recorder.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_entry_is_counted_as_failed() {
        let (store, _) = seeded_store().await;
        let recorder =
            FeedbackRecorder::spawn(store, Arc::new(RingHistoryLog::new(4)), &config());
        recorder.record_outcome(404, ExecutionOutcome::succeeded(1.0));
        recorder.flush().await;
        assert_eq!(recorder.stats().failed, 1);
        recorder.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_events() {
        let (store, id) = seeded_store().await;
        let recorder =
            FeedbackRecorder::spawn(store.clone(), Arc::new(RingHistoryLog::new(4)), &config());
        for _ in 0..20 {
            recorder.record_outcome(id, ExecutionOutcome::succeeded(5.0));
        }
        recorder.shutdown().await;
        assert_eq!(store.get_by_id(id).await.unwrap().success_count, 20);

        recorder.record_outcome(id, ExecutionOutcome::succeeded(5.0));
        assert_eq!(recorder.stats().dropped, 1);
    }

    /// Store that reports a conflict for the first N updates
    struct ContendedStore {
        inner: MemoryCacheStore,
        conflicts_left: AtomicU32,
    }

    #[async_trait]
    impl CacheEntryStore for ContendedStore {
        async fn get(&self, q: &str) -> Result<CacheEntry, StoreError> {
            self.inner.get(q).await
        }
        async fn get_by_id(&self, id: EntryId) -> Result<CacheEntry, StoreError> {
            self.inner.get_by_id(id).await
        }
        async fn put(&self, e: NewCacheEntry) -> Result<EntryId, StoreError> {
            self.inner.put(e).await
        }
        async fn record_outcome(
            &self,
            id: EntryId,
            o: &ExecutionOutcome,
        ) -> Result<EntryStats, StoreError> {
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Conflict(id));
            }
            self.inner.record_outcome(id, o).await
        }
        async fn list_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
            self.inner.list_entries().await
        }
        async fn len(&self) -> Result<usize, StoreError> {
            self.inner.len().await
        }
        fn name(&self) -> &str {
            "contended"
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_then_applied() {
        let inner = MemoryCacheStore::new(2);
        let id = inner
            .put(NewCacheEntry {
                query_text: "q".into(),
                embedding: vec![0.0, 1.0],
                promql_template: "up".into(),
            })
            .await
            .unwrap();
        let store = Arc::new(ContendedStore {
            inner,
            conflicts_left: AtomicU32::new(2),
        });

        let recorder =
            FeedbackRecorder::spawn(store.clone(), Arc::new(RingHistoryLog::new(4)), &config());
        recorder.record_outcome(id, ExecutionOutcome::succeeded(1.0));
        recorder.flush().await;

        assert_eq!(recorder.stats().conflict_retries, 2);
        assert_eq!(recorder.stats().outcomes_applied, 1);
        assert_eq!(store.get_by_id(id).await.unwrap().success_count, 1);
        recorder.shutdown().await;
    }

    #[tokio::test]
    async fn test_conflicts_exhaust_retry_budget() {
        let inner = MemoryCacheStore::new(2);
        let id = inner
            .put(NewCacheEntry {
                query_text: "q".into(),
                embedding: vec![0.0, 1.0],
                promql_template: "up".into(),
            })
            .await
            .unwrap();
        let store = Arc::new(ContendedStore {
            inner,
            conflicts_left: AtomicU32::new(100),
        });

        let recorder =
            FeedbackRecorder::spawn(store.clone(), Arc::new(RingHistoryLog::new(4)), &config());
        recorder.record_outcome(id, ExecutionOutcome::succeeded(1.0));
        recorder.flush().await;

        let stats = recorder.stats();
        assert_eq!(stats.conflict_retries, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(store.get_by_id(id).await.unwrap().success_count, 0);
        recorder.shutdown().await;
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 5,
            base: Duration::from_millis(10),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
    }
}
