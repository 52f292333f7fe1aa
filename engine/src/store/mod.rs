//! Cache entry store: durable CacheEntry rows with atomic statistic updates
//!
//! Both backends guarantee:
//! - one entry per canonical `query_text` (`put` fails with `DuplicateKey`)
//! - `record_outcome` is linearizable per entry without a store-wide lock

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StoreError;
use crate::history_log::{HistoryStore, RingHistoryLog};
use crate::schema::{CacheEntry, EntryId, EntryStats, ExecutionOutcome, NewCacheEntry};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCacheStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait CacheEntryStore: Send + Sync {
    /// Look up the entry owning a canonical query text
    async fn get(&self, query_text: &str) -> Result<CacheEntry, StoreError>;

    async fn get_by_id(&self, id: EntryId) -> Result<CacheEntry, StoreError>;

    /// Insert a new entry; `DuplicateKey` if the query text is taken
    async fn put(&self, entry: NewCacheEntry) -> Result<EntryId, StoreError>;

    /// Fold one execution outcome into the entry's statistics atomically.
    ///
    /// Returns the statistics after the update. `Conflict` means a
    /// concurrent writer held the row and the caller may retry.
    async fn record_outcome(
        &self,
        id: EntryId,
        outcome: &ExecutionOutcome,
    ) -> Result<EntryStats, StoreError>;

    /// Every entry, for rebuilding the embedding index at startup
    async fn list_entries(&self) -> Result<Vec<CacheEntry>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    /// Backend name (for metrics/logging)
    fn name(&self) -> &str;
}

/// Open the configured cache entry store and history store.
///
/// The SQLite backend serves both from one database file.
pub fn open_stores(
    config: &StorageConfig,
    dimension: usize,
) -> Result<(Arc<dyn CacheEntryStore>, Arc<dyn HistoryStore>), StoreError> {
    match config.backend {
        StorageBackend::Memory => {
            let entries: Arc<dyn CacheEntryStore> = Arc::new(MemoryCacheStore::new(dimension));
            let history: Arc<dyn HistoryStore> =
                Arc::new(RingHistoryLog::new(config.history_capacity));
            Ok((entries, history))
        }
        StorageBackend::Sqlite => {
            let store = Arc::new(SqliteStore::open(
                &config.sqlite_path,
                dimension,
                std::time::Duration::from_millis(config.busy_timeout_ms),
            )?);
            let entries: Arc<dyn CacheEntryStore> = store.clone();
            let history: Arc<dyn HistoryStore> = store;
            Ok((entries, history))
        }
    }
}
