//! PromCache engine: semantic cache for natural-language → PromQL translation
//!
//! A query is canonicalized and embedded, then looked up in the embedding
//! index. A neighbour is reused only when its derived confidence (similarity
//! weighted by the smoothed success rate of its template) clears the
//! acceptance threshold; otherwise the generator produces fresh PromQL, which
//! is cached. Execution outcomes flow back through the feedback recorder so
//! templates earn (or lose) trust over time.
//!
//! # Layout
//! - [`index`] / [`hnsw_index`]: nearest-neighbour search over entry embeddings
//! - [`store`]: cache entries with atomic statistic updates (memory or SQLite)
//! - [`feedback`]: asynchronous outcome and history recording
//! - [`orchestrator`]: the translation pipeline
//! - [`registry`], [`promql`]: service context and placeholder substitution
//! - [`upstream`]: Embedder / Generator / Executor seams and HTTP adapters
//! - [`http_api`]: axum routes served by `promcache_server`

pub mod confidence;
pub mod config;
pub mod error;
pub mod feedback;
pub mod history_log;
pub mod hnsw_index;
pub mod http_api;
pub mod index;
pub mod metrics;
pub mod orchestrator;
pub mod promql;
pub mod registry;
pub mod schema;
pub mod store;
pub mod text;
pub mod upstream;
pub mod vector;

pub use confidence::ConfidenceModel;
pub use config::PromCacheConfig;
pub use error::{Collaborator, IndexError, StoreError, TranslateError, UpstreamError};
pub use feedback::{FeedbackRecorder, FeedbackStats};
pub use history_log::{HistoryStore, RingHistoryLog};
pub use hnsw_index::HnswEmbeddingIndex;
pub use index::{EmbeddingIndex, LinearScanIndex, Neighbor};
pub use orchestrator::{
    Collaborators, OrchestratorStats, TranslationOrchestrator, TranslationRequest,
    TranslationResult,
};
pub use registry::{InMemoryRegistry, RegistryContext, ServiceRegistry};
pub use schema::{CacheEntry, EntryId, EntryStats, ExecutionOutcome, HistoryRecord, NewCacheEntry};
pub use store::{CacheEntryStore, MemoryCacheStore, SqliteStore};
pub use text::canonicalize;
pub use upstream::{Embedder, Executor, Generation, Generator};
