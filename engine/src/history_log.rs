//! Append-only query history
//!
//! Every translation attempt, hit or miss, success or failure, produces one
//! `HistoryRecord`. The in-memory log keeps the most recent records in a
//! fixed-capacity ring buffer; the oldest are overwritten once it is full.
//! The SQLite store implements the same trait durably.

use async_trait::async_trait;
use parking_lot::RwLock;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StoreError;
use crate::schema::HistoryRecord;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError>;

    /// Up to `limit` records, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Records currently retained
    async fn len(&self) -> Result<usize, StoreError>;
}

/// Bounded in-memory history
///
/// # Memory
/// Fixed footprint of `capacity` records; no growth under sustained load.
pub struct RingHistoryLog {
    records: RwLock<HeapRb<HistoryRecord>>,
    total_appends: AtomicU64,
    capacity: usize,
}

impl RingHistoryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(HeapRb::new(capacity)),
            total_appends: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends since startup, including overwritten records
    pub fn total_appends(&self) -> u64 {
        self.total_appends.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HistoryStore for RingHistoryLog {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError> {
        self.records.write().push_overwrite(record);
        self.total_appends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let records = self.records.read();
        let mut newest_first: Vec<HistoryRecord> = records.iter().cloned().collect();
        newest_first.reverse();
        newest_first.truncate(limit);
        Ok(newest_first)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().occupied_len())
    }
}
