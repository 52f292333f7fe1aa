//! SQLite-backed cache entry store and query history
//!
//! Each operation checks a connection out of a small pool and runs on the
//! blocking thread pool. Statistic updates are a single `UPDATE ... RETURNING`
//! statement, so the increment and the running mean are applied atomically
//! by SQLite's row write. A writer that cannot get the database within
//! `busy_timeout` surfaces as `StoreError::Conflict` for the caller to retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::CacheEntryStore;
use crate::error::StoreError;
use crate::history_log::HistoryStore;
use crate::schema::{
    CacheEntry, EntryId, EntryStats, ExecutionOutcome, HistoryRecord, NewCacheEntry,
};

const MAX_IDLE_CONNECTIONS: usize = 8;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_text TEXT NOT NULL UNIQUE,
    embedding_dimension INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    promql_template TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    avg_execution_time_ms REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS query_history (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    natural_query TEXT NOT NULL,
    generated_promql TEXT NOT NULL,
    intent_type TEXT,
    service_name TEXT,
    success INTEGER NOT NULL,
    execution_time_ms REAL,
    error_message TEXT,
    confidence_score REAL NOT NULL,
    cache_hit INTEGER NOT NULL,
    cache_entry_id INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_history_created_at
    ON query_history(created_at);
";

const ENTRY_COLUMNS: &str = "id, query_text, embedding_dimension, embedding, promql_template, \
     success_count, failure_count, avg_execution_time_ms, created_at, updated_at";

const HISTORY_COLUMNS: &str = "id, user_id, natural_query, generated_promql, intent_type, \
     service_name, success, execution_time_ms, error_message, confidence_score, cache_hit, \
     cache_entry_id, created_at";

/// Connections are opened lazily and returned to the idle list after use;
/// the pool mutex is never held while a statement runs.
struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    fn open_connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    fn checkout(&self) -> Result<Connection, StoreError> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        self.open_connection()
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }
}

pub struct SqliteStore {
    pool: Arc<ConnectionPool>,
    dimension: usize,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories
    pub fn open(
        path: impl AsRef<Path>,
        dimension: usize,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("create {}: {e}", parent.display()))
                })?;
            }
        }

        let pool = ConnectionPool {
            path,
            busy_timeout,
            idle: Mutex::new(Vec::new()),
        };

        let conn = pool.open_connection()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(
            path = %pool.path.display(),
            journal_mode = %mode,
            dimension,
            "opened sqlite cache store"
        );
        pool.checkin(conn);

        Ok(Self {
            pool: Arc::new(pool),
            dimension,
        })
    }

    pub fn path(&self) -> &Path {
        &self.pool.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let conn = pool.checkout()?;
            let result = f(&conn);
            pool.checkin(conn);
            result
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl CacheEntryStore for SqliteStore {
    async fn get(&self, query_text: &str) -> Result<CacheEntry, StoreError> {
        let key = query_text.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE query_text = ?1"),
                params![key],
                decode_entry_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound(key))
        })
        .await
    }

    async fn get_by_id(&self, id: EntryId) -> Result<CacheEntry, StoreError> {
        let row_id = to_i64(id)?;
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE id = ?1"),
                params![row_id],
                decode_entry_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("entry {id}")))
        })
        .await
    }

    #[instrument(level = "debug", skip(self, entry), fields(query = %entry.query_text))]
    async fn put(&self, entry: NewCacheEntry) -> Result<EntryId, StoreError> {
        if entry.embedding.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                got: entry.embedding.len(),
            });
        }

        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let inserted = conn.execute(
                "INSERT INTO cache_entries \
                 (query_text, embedding_dimension, embedding, promql_template, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    entry.query_text,
                    entry.embedding.len() as i64,
                    encode_embedding(&entry.embedding),
                    entry.promql_template,
                    now,
                ],
            );
            match inserted {
                Ok(_) => {
                    let id = conn.last_insert_rowid();
                    debug!(entry_id = id, query = %entry.query_text, "inserted cache entry");
                    to_u64(id)
                }
                Err(rusqlite::Error::SqliteFailure(code, _))
                    if code.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateKey(entry.query_text))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    #[instrument(level = "debug", skip(self, outcome), fields(success = outcome.success))]
    async fn record_outcome(
        &self,
        id: EntryId,
        outcome: &ExecutionOutcome,
    ) -> Result<EntryStats, StoreError> {
        let row_id = to_i64(id)?;
        let (successes, failures) = if outcome.success { (1i64, 0i64) } else { (0, 1) };
        let time_ms = outcome.execution_time_ms;

        self.with_conn(move |conn| {
            // SET expressions read the pre-update row, so the divisor is the new total
            let result = conn
                .query_row(
                    "UPDATE cache_entries SET \
                        success_count = success_count + ?2, \
                        failure_count = failure_count + ?3, \
                        avg_execution_time_ms = avg_execution_time_ms \
                            + (?4 - avg_execution_time_ms) / (success_count + failure_count + 1), \
                        updated_at = ?5 \
                     WHERE id = ?1 \
                     RETURNING success_count, failure_count, avg_execution_time_ms",
                    params![row_id, successes, failures, time_ms, Utc::now().to_rfc3339()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, f64>(2)?,
                        ))
                    },
                )
                .optional();

            match result {
                Ok(Some((s, f, avg))) => Ok(EntryStats {
                    success_count: to_u64(s)?,
                    failure_count: to_u64(f)?,
                    avg_execution_time_ms: avg,
                }),
                Ok(None) => Err(StoreError::NotFound(format!("entry {id}"))),
                Err(e) => match StoreError::from(e) {
                    StoreError::Conflict(_) => Err(StoreError::Conflict(id)),
                    other => Err(other),
                },
            }
        })
        .await
    }

    async fn list_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {ENTRY_COLUMNS} FROM cache_entries ORDER BY id"))?;
            let rows = stmt.query_map([], decode_entry_row)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
        .await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError> {
        let entry_id = record.cache_entry_id.map(to_i64).transpose()?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO query_history ({HISTORY_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    record.id.to_string(),
                    record.user_id,
                    record.natural_query,
                    record.generated_promql,
                    record.intent_type,
                    record.service_name,
                    record.success,
                    record.execution_time_ms,
                    record.error_message,
                    record.confidence_score,
                    record.cache_hit,
                    entry_id,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM query_history \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], decode_history_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM query_history", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }
}

fn decode_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let dimension: i64 = row.get(2)?;
    let blob: Vec<u8> = row.get(3)?;
    let embedding = decode_embedding(&blob, dimension as usize)
        .map_err(|e| conversion_error(3, rusqlite::types::Type::Blob, e))?;

    Ok(CacheEntry {
        id: row.get::<_, i64>(0)? as EntryId,
        query_text: row.get(1)?,
        embedding,
        promql_template: row.get(4)?,
        success_count: row.get::<_, i64>(5)?.max(0) as u64,
        failure_count: row.get::<_, i64>(6)?.max(0) as u64,
        avg_execution_time_ms: row.get(7)?,
        created_at: parse_timestamp(row, 8)?,
        updated_at: parse_timestamp(row, 9)?,
    })
}

fn decode_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let raw_id: String = row.get(0)?;
    let id = Uuid::parse_str(&raw_id)
        .map_err(|e| conversion_error(0, rusqlite::types::Type::Text, e.to_string()))?;

    Ok(HistoryRecord {
        id,
        user_id: row.get(1)?,
        natural_query: row.get(2)?,
        generated_promql: row.get(3)?,
        intent_type: row.get(4)?,
        service_name: row.get(5)?,
        success: row.get(6)?,
        execution_time_ms: row.get(7)?,
        error_message: row.get(8)?,
        confidence_score: row.get(9)?,
        cache_hit: row.get(10)?,
        cache_entry_id: row.get::<_, Option<i64>>(11)?.map(|v| v as EntryId),
        created_at: parse_timestamp(row, 12)?,
    })
}

fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, rusqlite::types::Type::Text, e.to_string()))
}

fn conversion_error(idx: usize, ty: rusqlite::types::Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.into())
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8], dimension: usize) -> Result<Vec<f32>, String> {
    if blob.len() != dimension * 4 {
        return Err(format!(
            "embedding blob is {} bytes, expected {}",
            blob.len(),
            dimension * 4
        ));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn to_i64(id: EntryId) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::NotFound(format!("entry {id}")))
}

fn to_u64(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Backend(format!("negative value {value}")))
}
