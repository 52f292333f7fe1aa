//! Error types for the translation pipeline
//!
//! Library boundaries return these typed errors; startup and configuration
//! code uses `anyhow` instead.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::schema::EntryId;

/// External collaborator that produced an upstream error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    Embedder,
    Generator,
    Executor,
}

impl Collaborator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collaborator::Embedder => "embedder",
            Collaborator::Generator => "generator",
            Collaborator::Executor => "executor",
        }
    }
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by an Embedder, Generator or Executor
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Cache entry store failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Another entry already owns this canonical query text
    #[error("cache entry already exists for query '{0}'")]
    DuplicateKey(String),

    #[error("cache entry not found: {0}")]
    NotFound(String),

    /// Concurrent writer held the row; safe to retry
    #[error("statistics update conflict on entry {0}")]
    Conflict(EntryId),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                // Row id is unknown at this layer; callers re-tag with the entry they were updating
                StoreError::Conflict(0)
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Embedding index failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("entry {0} is already indexed")]
    DuplicateKey(EntryId),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("index full: {0} elements")]
    Full(usize),

    /// Zero-norm or non-finite vectors have no direction to compare
    #[error("invalid vector: {0}")]
    InvalidVector(String),

    #[error("index backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by `TranslationOrchestrator::translate`
#[derive(Debug, Error)]
pub enum TranslateError {
    /// Malformed query or context; rejected before any external call
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{collaborator} unavailable: {source}")]
    UpstreamUnavailable {
        collaborator: Collaborator,
        #[source]
        source: UpstreamError,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl TranslateError {
    pub fn upstream(collaborator: Collaborator, source: UpstreamError) -> Self {
        TranslateError::UpstreamUnavailable {
            collaborator,
            source,
        }
    }

    /// Short machine-readable category used for metrics labels and HTTP bodies
    pub fn category(&self) -> &'static str {
        match self {
            TranslateError::Validation(_) => "validation",
            TranslateError::UpstreamUnavailable {
                source: UpstreamError::RateLimited { .. },
                ..
            } => "rate_limited",
            TranslateError::UpstreamUnavailable { .. } => "upstream_unavailable",
            TranslateError::Timeout(_) => "timeout",
            TranslateError::Storage(_) => "storage",
            TranslateError::Index(_) => "index",
        }
    }
}
