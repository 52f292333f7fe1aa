//! Records persisted by the cache entry store and the history log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a cache entry (row id in durable backends)
pub type EntryId = u64;

/// Stored mapping from a canonical natural-language query to a reusable PromQL template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: EntryId,

    /// Canonical query text; unique across the store
    pub query_text: String,

    pub embedding: Vec<f32>,

    /// PromQL with `{{placeholder}}` tokens
    pub promql_template: String,

    pub success_count: u64,
    pub failure_count: u64,

    /// Rolling mean over every recorded outcome
    pub avg_execution_time_ms: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn stats(&self) -> EntryStats {
        EntryStats {
            success_count: self.success_count,
            failure_count: self.failure_count,
            avg_execution_time_ms: self.avg_execution_time_ms,
        }
    }

    pub fn total_outcomes(&self) -> u64 {
        self.success_count + self.failure_count
    }
}

/// Entry as submitted by the orchestrator before the store assigns an id
#[derive(Debug, Clone, PartialEq)]
pub struct NewCacheEntry {
    pub query_text: String,
    pub embedding: Vec<f32>,
    pub promql_template: String,
}

/// Usage statistics of a single cache entry
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EntryStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_execution_time_ms: f64,
}

impl EntryStats {
    /// Fold one execution outcome into the statistics.
    ///
    /// The average is an incremental mean over all outcomes, so applying the
    /// same set of outcomes in any order converges to the same value.
    pub fn apply(&mut self, outcome: &ExecutionOutcome) {
        if outcome.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        let total = (self.success_count + self.failure_count) as f64;
        self.avg_execution_time_ms +=
            (outcome.execution_time_ms - self.avg_execution_time_ms) / total;
    }
}

/// Result of running (or reporting) a PromQL query against the metrics backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub execution_time_ms: f64,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(execution_time_ms: f64) -> Self {
        Self {
            success: true,
            execution_time_ms,
            error: None,
        }
    }

    pub fn failed(execution_time_ms: f64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            execution_time_ms,
            error: Some(error.into()),
        }
    }
}

/// Append-only record of one translation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub natural_query: String,
    pub generated_promql: String,
    pub intent_type: Option<String>,
    pub service_name: Option<String>,
    pub success: bool,
    pub execution_time_ms: Option<f64>,
    pub error_message: Option<String>,
    pub confidence_score: f64,
    pub cache_hit: bool,
    pub cache_entry_id: Option<EntryId>,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Skeleton record for a query; callers fill in the outcome fields
    pub fn for_query(natural_query: &str, user_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            natural_query: natural_query.to_string(),
            generated_promql: String::new(),
            intent_type: None,
            service_name: None,
            success: false,
            execution_time_ms: None,
            error_message: None,
            confidence_score: 0.0,
            cache_hit: false,
            cache_entry_id: None,
            created_at: Utc::now(),
        }
    }
}
