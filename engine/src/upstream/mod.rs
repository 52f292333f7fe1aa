//! External collaborators: Embedder, Generator, Executor
//!
//! The orchestrator depends only on these traits. `http` provides adapters
//! for OpenAI-compatible embedding/chat endpoints and the Prometheus HTTP API;
//! tests script their own implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::registry::RegistryContext;
use crate::schema::ExecutionOutcome;

pub mod breaker;
pub mod http;

pub use breaker::{BreakerConfig, BreakerState, UpstreamBreaker};
pub use http::{ChatGenerator, OpenAiEmbedder, PrometheusExecutor};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed already-canonicalized text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError>;
}

/// PromQL produced for a query the cache could not answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// PromQL, possibly with `{{placeholder}}` tokens
    pub promql_template: String,

    /// Generator's own confidence in [0, 1], if it reports one
    pub confidence: Option<f64>,

    pub intent_type: Option<String>,
}

impl Generation {
    pub fn new(promql_template: impl Into<String>) -> Self {
        Self {
            promql_template: promql_template.into(),
            confidence: None,
            intent_type: None,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        query: &str,
        context: &RegistryContext,
    ) -> Result<Generation, UpstreamError>;
}

/// Validation-only execution of PromQL.
///
/// `Ok` with `success = false` means the backend rejected the query;
/// `Err` means the backend could not be reached.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, promql: &str) -> Result<ExecutionOutcome, UpstreamError>;
}
