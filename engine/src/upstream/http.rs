//! HTTP adapters for the upstream traits

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Embedder, Executor, Generation, Generator};
use crate::error::UpstreamError;
use crate::registry::RegistryContext;
use crate::schema::ExecutionOutcome;

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_builder() {
        UpstreamError::InvalidRequest(err.to_string())
    } else {
        UpstreamError::Unavailable(err.to_string())
    }
}

/// Map a non-success HTTP status onto the upstream error taxonomy
async fn status_error(response: Response) -> UpstreamError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = format!("status {status}: {}", body.chars().take(512).collect::<String>());

    if status == StatusCode::TOO_MANY_REQUESTS {
        UpstreamError::RateLimited {
            message,
            retry_after,
        }
    } else if status.is_client_error() {
        UpstreamError::InvalidRequest(message)
    } else {
        UpstreamError::Unavailable(message)
    }
}

/// OpenAI-compatible `/v1/embeddings` client
pub struct OpenAiEmbedder {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({ "model": self.model, "input": text }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("malformed embedding response: {e}")))?;
        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| UpstreamError::Unavailable("empty embedding response".to_string()))
    }
}

/// OpenAI-compatible `/v1/chat/completions` client that asks for PromQL
pub struct ChatGenerator {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct GeneratedPromql {
    promql: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    intent: Option<String>,
}

const SYSTEM_PROMPT: &str = "Translate the user's question into a single PromQL expression. \
Use {{namespace}}, {{service}} or {{time_range}} placeholders where the value depends on the caller. \
Reply with JSON only: {\"promql\": string, \"confidence\": number between 0 and 1, \"intent\": string}.";

impl ChatGenerator {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            model: model.into(),
            api_key,
        })
    }
}

/// Parse the model's reply; bare PromQL (optionally fenced) is accepted too
fn parse_generation(content: &str) -> Result<Generation, UpstreamError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```promql")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(parsed) = serde_json::from_str::<GeneratedPromql>(trimmed) {
        if parsed.promql.trim().is_empty() {
            return Err(UpstreamError::InvalidRequest("generator returned empty PromQL".into()));
        }
        return Ok(Generation {
            promql_template: parsed.promql.trim().to_string(),
            confidence: parsed.confidence.map(|c| c.clamp(0.0, 1.0)),
            intent_type: parsed.intent,
        });
    }

    if trimmed.is_empty() {
        return Err(UpstreamError::InvalidRequest("generator returned empty PromQL".into()));
    }
    Ok(Generation::new(trimmed))
}

#[async_trait]
impl Generator for ChatGenerator {
    async fn generate(
        &self,
        query: &str,
        context: &RegistryContext,
    ) -> Result<Generation, UpstreamError> {
        let mut system = SYSTEM_PROMPT.to_string();
        if !context.is_empty() {
            system.push_str("\nKnown services and metrics:\n");
            system.push_str(&context.render());
        }

        let mut request = self.client.post(&self.url).json(&json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": query },
            ],
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("malformed chat response: {e}")))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| UpstreamError::Unavailable("chat response had no choices".into()))?;

        debug!(chars = content.len(), "generator replied");
        parse_generation(&content)
    }
}

/// Prometheus `/api/v1/query` instant-query validator
pub struct PrometheusExecutor {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl PrometheusExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Executor for PrometheusExecutor {
    async fn execute(&self, promql: &str) -> Result<ExecutionOutcome, UpstreamError> {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", promql)])
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();

        // Prometheus answers bad_data / execution errors with 400 / 422 and a JSON body
        if !status.is_success()
            && status != StatusCode::BAD_REQUEST
            && status != StatusCode::UNPROCESSABLE_ENTITY
        {
            return Err(status_error(response).await);
        }

        let body: PrometheusResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("malformed prometheus response: {e}")))?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        if body.status == "success" {
            Ok(ExecutionOutcome::succeeded(elapsed_ms))
        } else {
            let error = match (body.error_type, body.error) {
                (Some(kind), Some(msg)) => format!("{kind}: {msg}"),
                (None, Some(msg)) => msg,
                (Some(kind), None) => kind,
                (None, None) => format!("query failed with status {status}"),
            };
            Ok(ExecutionOutcome::failed(elapsed_ms, error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_generation() {
        let g = parse_generation(
            r#"{"promql": "sum(rate(http_requests_total[5m]))", "confidence": 1.7, "intent": "rate"}"#,
        )
        .unwrap();
        assert_eq!(g.promql_template, "sum(rate(http_requests_total[5m]))");
        assert_eq!(g.confidence, Some(1.0));
        assert_eq!(g.intent_type.as_deref(), Some("rate"));
    }

    #[test]
    fn test_parse_fenced_plain_promql() {
        let g = parse_generation("```promql\nup{job=\"api\"}\n```").unwrap();
        assert_eq!(g.promql_template, "up{job=\"api\"}");
        assert_eq!(g.confidence, None);
    }

    #[test]
    fn test_parse_empty_rejected() {
        assert!(matches!(
            parse_generation("   "),
            Err(UpstreamError::InvalidRequest(_))
        ));
        assert!(parse_generation(r#"{"promql": ""}"#).is_err());
    }
}
