//! HTTP API
//!
//! - `POST /api/v1/query`     translate a natural-language query
//! - `POST /api/v1/feedback`  report the execution of a returned query
//! - `GET  /api/v1/history`   most recent history records
//! - `GET  /api/v1/stats`     pipeline counters
//! - `GET  /health`           liveness
//! - `GET  /metrics`          Prometheus text exposition

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::error::{StoreError, TranslateError, UpstreamError};
use crate::feedback::FeedbackStats;
use crate::history_log::HistoryStore;
use crate::metrics;
use crate::orchestrator::{OrchestratorStats, TranslationOrchestrator, TranslationRequest};
use crate::schema::{EntryId, HistoryRecord};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TranslationOrchestrator>,
    pub history: Arc<dyn HistoryStore>,
    pub started: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<TranslationOrchestrator>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            orchestrator,
            history,
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/query", post(query_handler))
        .route("/api/v1/feedback", post(feedback_handler))
        .route("/api/v1/history", get(history_handler))
        .route("/api/v1/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub promql: String,
    pub explanation: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    pub estimated_cost: f64,
    pub cache_hit: bool,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub entry_id: EntryId,
    pub success: bool,
    pub execution_time_ms: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    translations: OrchestratorStats,
    feedback: FeedbackStats,
    index_backend: String,
    indexed_entries: usize,
    store_backend: String,
    stored_entries: Option<usize>,
    uptime_seconds: u64,
}

/// `TranslateError` rendered as a JSON error with a matching status code
pub struct ApiError(TranslateError);

impl From<TranslateError> for ApiError {
    fn from(err: TranslateError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            TranslateError::Validation(_) => StatusCode::BAD_REQUEST,
            TranslateError::UpstreamUnavailable {
                source: UpstreamError::RateLimited { .. },
                ..
            } => StatusCode::TOO_MANY_REQUESTS,
            TranslateError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            TranslateError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            TranslateError::Storage(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            TranslateError::Storage(_) | TranslateError::Index(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.category().to_string(),
            }),
        )
            .into_response();

        if let TranslateError::UpstreamUnavailable {
            source:
                UpstreamError::RateLimited {
                    retry_after: Some(after),
                    ..
                },
            ..
        } = &self.0
        {
            if let Ok(value) = after.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<TranslationRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let result = state.orchestrator.translate(request).await?;
    Ok(Json(QueryResponse {
        promql: result.promql,
        explanation: result.explanation,
        confidence: result.confidence,
        suggestions: result.suggestions,
        estimated_cost: result.estimated_cost,
        cache_hit: result.cache_hit,
        processing_time_ms: result.processing_time.as_millis() as u64,
        entry_id: result.entry_id,
    }))
}

async fn feedback_handler(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .report_execution(request.entry_id, request.success, request.execution_time_ms)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let records = state
        .history
        .recent(limit)
        .await
        .map_err(TranslateError::from)?;
    Ok(Json(records))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = &state.orchestrator;
    let index = orchestrator.index();
    let store = orchestrator.store();

    Json(StatsResponse {
        translations: orchestrator.stats(),
        feedback: orchestrator.feedback().stats(),
        index_backend: index.name().to_string(),
        indexed_entries: index.len(),
        store_backend: store.name().to_string(),
        stored_entries: store.len().await.ok(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started.elapsed().as_secs(),
        "indexed_entries": state.orchestrator.index().len(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
