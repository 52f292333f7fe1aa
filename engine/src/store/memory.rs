//! In-memory cache entry store
//!
//! The map lock is only held to locate a row; statistic updates lock the row
//! itself, so outcomes for different entries never serialize on each other.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::CacheEntryStore;
use crate::error::StoreError;
use crate::schema::{CacheEntry, EntryId, EntryStats, ExecutionOutcome, NewCacheEntry};

type Row = Arc<Mutex<CacheEntry>>;

#[derive(Default)]
struct Rows {
    by_text: HashMap<String, EntryId>,
    by_id: HashMap<EntryId, Row>,
}

pub struct MemoryCacheStore {
    rows: RwLock<Rows>,
    next_id: AtomicU64,
    dimension: usize,
}

impl MemoryCacheStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
            next_id: AtomicU64::new(1),
            dimension,
        }
    }

    fn row(&self, id: EntryId) -> Result<Row, StoreError> {
        self.rows
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("entry {id}")))
    }
}

#[async_trait]
impl CacheEntryStore for MemoryCacheStore {
    async fn get(&self, query_text: &str) -> Result<CacheEntry, StoreError> {
        let row = {
            let rows = self.rows.read();
            rows.by_text
                .get(query_text)
                .and_then(|id| rows.by_id.get(id))
                .cloned()
        };
        match row {
            Some(row) => Ok(row.lock().clone()),
            None => Err(StoreError::NotFound(query_text.to_string())),
        }
    }

    async fn get_by_id(&self, id: EntryId) -> Result<CacheEntry, StoreError> {
        Ok(self.row(id)?.lock().clone())
    }

    async fn put(&self, entry: NewCacheEntry) -> Result<EntryId, StoreError> {
        if entry.embedding.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                got: entry.embedding.len(),
            });
        }

        let mut rows = self.rows.write();
        if rows.by_text.contains_key(&entry.query_text) {
            return Err(StoreError::DuplicateKey(entry.query_text));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let row = CacheEntry {
            id,
            query_text: entry.query_text.clone(),
            embedding: entry.embedding,
            promql_template: entry.promql_template,
            success_count: 0,
            failure_count: 0,
            avg_execution_time_ms: 0.0,
            created_at: now,
            updated_at: now,
        };
        rows.by_text.insert(entry.query_text, id);
        rows.by_id.insert(id, Arc::new(Mutex::new(row)));
        Ok(id)
    }

    async fn record_outcome(
        &self,
        id: EntryId,
        outcome: &ExecutionOutcome,
    ) -> Result<EntryStats, StoreError> {
        let row = self.row(id)?;
        let mut entry = row.lock();
        let mut stats = entry.stats();
        stats.apply(outcome);
        entry.success_count = stats.success_count;
        entry.failure_count = stats.failure_count;
        entry.avg_execution_time_ms = stats.avg_execution_time_ms;
        entry.updated_at = Utc::now();
        Ok(stats)
    }

    async fn list_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let rows: Vec<Row> = self.rows.read().by_id.values().cloned().collect();
        let mut entries: Vec<CacheEntry> = rows.iter().map(|r| r.lock().clone()).collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.rows.read().by_id.len())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(text: &str) -> NewCacheEntry {
        NewCacheEntry {
            query_text: text.to_string(),
            embedding: vec![1.0, 0.0, 0.0],
            promql_template: "sum(rate(http_requests_total[5m]))".to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryCacheStore::new(3);
        let id = store.put(new_entry("error rate")).await.unwrap();

        let entry = store.get("error rate").await.unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.total_outcomes(), 0);
        assert_eq!(store.get_by_id(id).await.unwrap(), entry);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let store = MemoryCacheStore::new(3);
        store.put(new_entry("latency")).await.unwrap();
        let err = store.put(new_entry("latency")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(ref q) if q == "latency"));
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dimension_enforced() {
        let store = MemoryCacheStore::new(4);
        let err = store.put(new_entry("cpu")).await.unwrap_err();
        assert_eq!(err, StoreError::DimensionMismatch { expected: 4, got: 3 });
    }

    #[tokio::test]
    async fn test_missing_entries() {
        let store = MemoryCacheStore::new(3);
        assert!(matches!(store.get("nope").await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.record_outcome(99, &ExecutionOutcome::succeeded(1.0)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_outcome_updates_stats() {
        let store = MemoryCacheStore::new(3);
        let id = store.put(new_entry("memory usage")).await.unwrap();

        store.record_outcome(id, &ExecutionOutcome::succeeded(100.0)).await.unwrap();
        let stats = store
            .record_outcome(id, &ExecutionOutcome::failed(50.0, "bad_data"))
            .await
            .unwrap();

        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.avg_execution_time_ms - 75.0).abs() < 1e-9);
        assert_eq!(store.get_by_id(id).await.unwrap().stats(), stats);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_outcomes_are_not_lost() {
        let store = Arc::new(MemoryCacheStore::new(3));
        let id = store.put(new_entry("disk io")).await.unwrap();

        let mut tasks = Vec::new();
        for t in 0..16u64 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                for i in 0..50u64 {
                    let outcome = if (t + i) % 3 == 0 {
                        ExecutionOutcome::failed(20.0, "timeout")
                    } else {
                        ExecutionOutcome::succeeded(20.0)
                    };
                    store.record_outcome(id, &outcome).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let entry = store.get_by_id(id).await.unwrap();
        assert_eq!(entry.total_outcomes(), 800);
        assert!((entry.avg_execution_time_ms - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_list_entries_sorted_by_id() {
        let store = MemoryCacheStore::new(3);
        let a = store.put(new_entry("a")).await.unwrap();
        let b = store.put(new_entry("b")).await.unwrap();
        let ids: Vec<_> = store.list_entries().await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b]);
    }
}
