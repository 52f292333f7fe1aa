//! Translation orchestrator: natural-language query → PromQL
//!
//! Pipeline per request:
//! 1. validate and canonicalize the query
//! 2. embed the canonical text
//! 3. search the embedding index for close neighbours
//! 4. reuse the most trusted neighbour's template if its confidence clears
//!    the acceptance threshold, otherwise generate and cache a new one
//! 5. optionally validate through the executor
//! 6. hand history and execution outcome to the feedback recorder
//!
//! Every request that passes validation leaves exactly one history record,
//! including upstream failures and timeouts.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::confidence::ConfidenceModel;
use crate::config::{PromCacheConfig, ValidationPolicy};
use crate::error::{Collaborator, IndexError, StoreError, TranslateError, UpstreamError};
use crate::feedback::FeedbackRecorder;
use crate::index::{EmbeddingIndex, Neighbor};
use crate::metrics;
use crate::promql::{self, Substitution};
use crate::registry::{RegistryContext, ServiceRegistry};
use crate::schema::{CacheEntry, EntryId, ExecutionOutcome, HistoryRecord, NewCacheEntry};
use crate::store::CacheEntryStore;
use crate::text::canonicalize;
use crate::upstream::{BreakerConfig, Embedder, Executor, Generator, UpstreamBreaker};

/// Confidence multiplier when a returned query still contains placeholders
const UNRESOLVED_PLACEHOLDER_FACTOR: f64 = 0.8;

const MAX_CONTEXT_VALUE_LEN: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub query: String,

    /// Range window such as `5m`; fills `{{time_range}}` placeholders
    #[serde(default)]
    pub time_range: Option<String>,

    /// Caller-supplied placeholder values (`namespace`, `service`, `job`, ...)
    #[serde(default)]
    pub context: HashMap<String, String>,

    #[serde(default)]
    pub user_id: Option<String>,
}

impl TranslationRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_time_range(mut self, time_range: impl Into<String>) -> Self {
        self.time_range = Some(time_range.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationResult {
    /// PromQL with placeholders resolved as far as possible
    pub promql: String,
    pub confidence: f64,
    pub cache_hit: bool,
    pub explanation: String,
    pub estimated_cost: f64,

    /// Entry the result came from or was stored as; `None` when a fresh
    /// generation bypassed a distrusted entry
    pub entry_id: Option<EntryId>,

    /// Similarity of the reused entry (hits only)
    pub similarity: Option<f32>,

    /// Canonical texts of other close cached queries
    pub suggestions: Vec<String>,

    /// Executor result when the query was validated
    pub execution: Option<ExecutionOutcome>,

    #[serde(skip)]
    pub processing_time: Duration,
}

/// External collaborators the orchestrator calls
#[derive(Clone)]
pub struct Collaborators {
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    /// `None` disables validation regardless of policy
    pub executor: Option<Arc<dyn Executor>>,
}

/// Tunables copied out of `PromCacheConfig`
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub confidence_threshold: f64,
    pub default_generation_confidence: f64,
    pub max_query_length: usize,
    pub validation: ValidationPolicy,
    pub failure_confidence_penalty: f64,
    pub request_timeout: Duration,
    pub max_context_services: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &PromCacheConfig) -> Self {
        Self {
            top_k: config.cache.top_k,
            similarity_threshold: config.cache.similarity_threshold,
            confidence_threshold: config.cache.confidence_threshold,
            default_generation_confidence: config.cache.default_generation_confidence,
            max_query_length: config.cache.max_query_length,
            validation: config.executor.validation,
            failure_confidence_penalty: config.executor.failure_confidence_penalty,
            request_timeout: config.request_timeout(),
            max_context_services: config.registry.max_context_services,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub translations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub generations: u64,
    pub put_races: u64,
    /// Misses whose own canonical entry was scored and rejected
    pub uncached_generations: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    translations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    generations: AtomicU64,
    put_races: AtomicU64,
    uncached_generations: AtomicU64,
    errors: AtomicU64,
}

struct Breakers {
    embedder: UpstreamBreaker,
    generator: UpstreamBreaker,
    executor: UpstreamBreaker,
}

/// What a request had established before it finished, failed or timed out
#[derive(Default)]
struct Progress {
    promql: Option<String>,
    entry_id: Option<EntryId>,
    cache_hit: bool,
    intent_type: Option<String>,
    service_name: Option<String>,
}

/// A cached entry scored against the current query
struct Candidate {
    entry: CacheEntry,
    similarity: f32,
    confidence: f64,
}

/// How a miss ended up with its template
enum MissKind {
    /// This request created the entry
    Created(EntryId),
    /// A concurrent request won the insert; its template is served
    Existing(CacheEntry),
}

pub struct TranslationOrchestrator {
    index: Arc<dyn EmbeddingIndex>,
    store: Arc<dyn CacheEntryStore>,
    feedback: Arc<FeedbackRecorder>,
    registry: Arc<dyn ServiceRegistry>,
    collaborators: Collaborators,
    breakers: Breakers,
    model: ConfidenceModel,
    settings: OrchestratorSettings,
    counters: Counters,
}

impl TranslationOrchestrator {
    pub fn new(
        config: &PromCacheConfig,
        index: Arc<dyn EmbeddingIndex>,
        store: Arc<dyn CacheEntryStore>,
        feedback: Arc<FeedbackRecorder>,
        registry: Arc<dyn ServiceRegistry>,
        collaborators: Collaborators,
    ) -> Self {
        let breaker_config = BreakerConfig::from_upstream(&config.upstream);
        Self {
            index,
            store,
            feedback,
            registry,
            collaborators,
            breakers: Breakers {
                embedder: UpstreamBreaker::new(Collaborator::Embedder, breaker_config.clone()),
                generator: UpstreamBreaker::new(Collaborator::Generator, breaker_config.clone()),
                executor: UpstreamBreaker::new(Collaborator::Executor, breaker_config),
            },
            model: ConfidenceModel::from_config(&config.cache),
            settings: OrchestratorSettings::from_config(config),
            counters: Counters::default(),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn feedback(&self) -> &Arc<FeedbackRecorder> {
        &self.feedback
    }

    pub fn index(&self) -> &Arc<dyn EmbeddingIndex> {
        &self.index
    }

    pub fn store(&self) -> &Arc<dyn CacheEntryStore> {
        &self.store
    }

    pub fn stats(&self) -> OrchestratorStats {
        let c = &self.counters;
        OrchestratorStats {
            translations: c.translations.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            generations: c.generations.load(Ordering::Relaxed),
            put_races: c.put_races.load(Ordering::Relaxed),
            uncached_generations: c.uncached_generations.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    /// Translate a natural-language query into PromQL.
    ///
    /// Validation errors return before any external call and leave no trace.
    /// Everything else, success or failure, is written to the history log.
    #[instrument(
        name = "translate",
        skip_all,
        fields(user_id = ?request.user_id, cache_hit = tracing::field::Empty)
    )]
    pub async fn translate(
        &self,
        request: TranslationRequest,
    ) -> Result<TranslationResult, TranslateError> {
        let started = Instant::now();
        if let Err(e) = self.validate(&request) {
            metrics::TRANSLATION_ERRORS_TOTAL
                .with_label_values(&[e.category()])
                .inc();
            return Err(e);
        }

        let progress = Mutex::new(Progress::default());
        let timeout = self.settings.request_timeout;
        let outcome = match tokio::time::timeout(timeout, self.run(&request, &progress)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TranslateError::Timeout(timeout)),
        };
        let progress = progress.into_inner();

        let mut record = HistoryRecord::for_query(&request.query, request.user_id.clone());
        record.intent_type = progress.intent_type.clone();
        record.service_name = progress
            .service_name
            .clone()
            .or_else(|| request.context.get("service").cloned());
        self.counters.translations.fetch_add(1, Ordering::Relaxed);
        metrics::TRANSLATION_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(mut result) => {
                result.processing_time = started.elapsed();
                tracing::Span::current().record("cache_hit", result.cache_hit);

                record.generated_promql = result.promql.clone();
                record.confidence_score = result.confidence;
                record.cache_hit = result.cache_hit;
                record.cache_entry_id = result.entry_id;
                match &result.execution {
                    Some(execution) => {
                        record.success = execution.success;
                        record.execution_time_ms = Some(execution.execution_time_ms);
                        record.error_message = execution.error.clone();
                    }
                    None => record.success = true,
                }
                self.feedback.record_history(record);

                let label = if result.cache_hit { "hit" } else { "miss" };
                metrics::TRANSLATIONS_TOTAL.with_label_values(&[label]).inc();
                metrics::RETURNED_CONFIDENCE.observe(result.confidence);
                info!(
                    cache_hit = result.cache_hit,
                    entry_id = ?result.entry_id,
                    confidence = result.confidence,
                    elapsed_ms = result.processing_time.as_millis() as u64,
                    "translated query"
                );
                Ok(result)
            }
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                metrics::TRANSLATION_ERRORS_TOTAL
                    .with_label_values(&[err.category()])
                    .inc();

                record.generated_promql = progress.promql.unwrap_or_default();
                record.cache_hit = progress.cache_hit;
                record.cache_entry_id = progress.entry_id;
                record.success = false;
                record.error_message = Some(err.to_string());
                self.feedback.record_history(record);

                warn!(error = %err, category = err.category(), "translation failed");
                Err(err)
            }
        }
    }

    /// Report the result of running a previously returned query.
    ///
    /// Used when validation was skipped and the caller executes the PromQL
    /// itself. The update is applied asynchronously.
    pub async fn report_execution(
        &self,
        entry_id: EntryId,
        success: bool,
        execution_time_ms: f64,
    ) -> Result<(), TranslateError> {
        if !execution_time_ms.is_finite() || execution_time_ms < 0.0 {
            return Err(TranslateError::Validation(format!(
                "execution_time_ms must be a non-negative number, got {execution_time_ms}"
            )));
        }
        self.store.get_by_id(entry_id).await?;

        let outcome = if success {
            ExecutionOutcome::succeeded(execution_time_ms)
        } else {
            ExecutionOutcome::failed(execution_time_ms, "reported by caller")
        };
        self.feedback.record_outcome(entry_id, outcome);
        Ok(())
    }

    fn validate(&self, request: &TranslationRequest) -> Result<(), TranslateError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(TranslateError::Validation("query must not be empty".into()));
        }
        let length = query.chars().count();
        if length > self.settings.max_query_length {
            return Err(TranslateError::Validation(format!(
                "query is {length} characters, limit is {}",
                self.settings.max_query_length
            )));
        }
        if canonicalize(query).is_empty() {
            return Err(TranslateError::Validation(
                "query has no content after normalization".into(),
            ));
        }

        for (key, value) in &request.context {
            let mut chars = key.chars();
            let valid_key = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_key {
                return Err(TranslateError::Validation(format!(
                    "context key '{key}' is not an identifier"
                )));
            }
            if value.len() > MAX_CONTEXT_VALUE_LEN || value.chars().any(char::is_control) {
                return Err(TranslateError::Validation(format!(
                    "context value for '{key}' is too long or contains control characters"
                )));
            }
        }

        if let Some(range) = &request.time_range {
            if promql::parse_duration_secs(range).map_or(true, |secs| secs <= 0.0) {
                return Err(TranslateError::Validation(format!(
                    "time_range '{range}' is not a PromQL duration"
                )));
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        request: &TranslationRequest,
        progress: &Mutex<Progress>,
    ) -> Result<TranslationResult, TranslateError> {
        let canonical = canonicalize(&request.query);
        let embedding = self.embed(&canonical).await?;

        let neighbors = self.index.nearest_neighbors(
            &embedding,
            self.settings.top_k,
            self.settings.similarity_threshold,
        )?;
        let candidates = self.score(&neighbors).await?;

        let best = candidates
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Earlier (more similar) candidates win ties
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i);

        match best {
            Some(i) if candidates[i].confidence > self.settings.confidence_threshold => {
                self.serve_hit(request, &candidates, i, progress).await
            }
            _ => {
                self.serve_miss(request, &canonical, embedding, &candidates, progress)
                    .await
            }
        }
    }

    /// Load the entries behind index hits and attach their confidence
    async fn score(&self, neighbors: &[Neighbor]) -> Result<Vec<Candidate>, TranslateError> {
        let mut candidates = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            match self.store.get_by_id(neighbor.entry_id).await {
                Ok(entry) => {
                    let confidence = self.model.confidence(neighbor.similarity, &entry.stats());
                    candidates.push(Candidate {
                        entry,
                        similarity: neighbor.similarity,
                        confidence,
                    });
                }
                Err(StoreError::NotFound(_)) => {
                    warn!(entry_id = neighbor.entry_id, "indexed entry missing from store");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(candidates)
    }

    async fn serve_hit(
        &self,
        request: &TranslationRequest,
        candidates: &[Candidate],
        chosen: usize,
        progress: &Mutex<Progress>,
    ) -> Result<TranslationResult, TranslateError> {
        let candidate = &candidates[chosen];
        let entry = &candidate.entry;
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!(
            entry_id = entry.id,
            similarity = candidate.similarity,
            confidence = candidate.confidence,
            "cache hit"
        );

        let substitution = self.substitute(&entry.promql_template, request);
        {
            let mut p = progress.lock();
            p.promql = Some(substitution.promql.clone());
            p.entry_id = Some(entry.id);
            p.cache_hit = true;
            p.service_name = substitution.service.as_ref().map(|s| s.name.clone());
        }

        let mut explanation = format!(
            "Reused cached translation of \"{}\" (similarity {:.3}, {} successful and {} failed runs).",
            entry.query_text, candidate.similarity, entry.success_count, entry.failure_count
        );
        let mut confidence = candidate.confidence;
        note_unresolved(&substitution, &mut confidence, &mut explanation);

        let validate = self.settings.validation == ValidationPolicy::Always;
        let execution = self
            .validate_promql(&substitution.promql, validate, &mut confidence, &mut explanation)
            .await;
        if let Some(outcome) = &execution {
            self.feedback.record_outcome(entry.id, outcome.clone());
        }

        let suggestions = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chosen)
            .map(|(_, c)| c.entry.query_text.clone())
            .collect();

        Ok(TranslationResult {
            estimated_cost: promql::estimate_cost(&substitution.promql),
            promql: substitution.promql,
            confidence,
            cache_hit: true,
            explanation,
            entry_id: Some(entry.id),
            similarity: Some(candidate.similarity),
            suggestions,
            execution,
            processing_time: Duration::ZERO,
        })
    }

    async fn serve_miss(
        &self,
        request: &TranslationRequest,
        canonical: &str,
        embedding: Vec<f32>,
        candidates: &[Candidate],
        progress: &Mutex<Progress>,
    ) -> Result<TranslationResult, TranslateError> {
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        let context = RegistryContext::build(
            self.registry.as_ref(),
            &request.query,
            self.settings.max_context_services,
        );
        let generation = self
            .call_upstream(
                Collaborator::Generator,
                &self.breakers.generator,
                self.collaborators.generator.generate(&request.query, &context),
            )
            .await?;
        self.counters.generations.fetch_add(1, Ordering::Relaxed);
        progress.lock().intent_type = generation.intent_type.clone();

        let mut confidence = generation
            .confidence
            .unwrap_or(self.settings.default_generation_confidence)
            .clamp(0.0, 1.0);

        let generated = generation.promql_template;

        // An entry for this exact text that was just scored and rejected is
        // not trusted; the fresh generation is served and nothing is recorded
        // against the old template
        let rejected = candidates
            .iter()
            .find(|c| c.entry.query_text == canonical)
            .map(|c| c.entry.id);

        let (entry_id, template, mut explanation) = if let Some(rejected_id) = rejected {
            self.counters.uncached_generations.fetch_add(1, Ordering::Relaxed);
            debug!(
                entry_id = rejected_id,
                "cached entry below threshold, serving fresh generation"
            );
            (
                None,
                generated,
                format!(
                    "Cached entry {rejected_id} is below the confidence threshold; \
                     generated new PromQL without caching it."
                ),
            )
        } else {
            match self.cache_generation(canonical, embedding, &generated).await? {
                MissKind::Created(id) => (
                    Some(id),
                    generated,
                    format!("Generated new PromQL and cached it as entry {id}."),
                ),
                MissKind::Existing(entry) if entry.promql_template == generated => (
                    Some(entry.id),
                    generated,
                    format!("Generated PromQL matches cached entry {}.", entry.id),
                ),
                MissKind::Existing(entry) => {
                    // Same canonical text, so similarity is exact
                    confidence = confidence.min(self.model.confidence(1.0, &entry.stats()));
                    (
                        Some(entry.id),
                        entry.promql_template,
                        format!(
                            "Query is already cached as entry {}; serving its template.",
                            entry.id
                        ),
                    )
                }
            }
        };

        let substitution = self.substitute(&template, request);
        {
            let mut p = progress.lock();
            p.promql = Some(substitution.promql.clone());
            p.entry_id = entry_id;
            p.service_name = substitution.service.as_ref().map(|s| s.name.clone());
        }
        note_unresolved(&substitution, &mut confidence, &mut explanation);

        let validate = matches!(
            self.settings.validation,
            ValidationPolicy::Always | ValidationPolicy::OnMiss
        );
        let execution = self
            .validate_promql(&substitution.promql, validate, &mut confidence, &mut explanation)
            .await;
        if let (Some(id), Some(outcome)) = (entry_id, &execution) {
            self.feedback.record_outcome(id, outcome.clone());
        }

        let suggestions = candidates
            .iter()
            .map(|c| c.entry.query_text.clone())
            .filter(|text| text != canonical)
            .take(self.settings.top_k.saturating_sub(1))
            .collect();

        Ok(TranslationResult {
            estimated_cost: promql::estimate_cost(&substitution.promql),
            promql: substitution.promql,
            confidence,
            cache_hit: false,
            explanation,
            entry_id,
            similarity: None,
            suggestions,
            execution,
            processing_time: Duration::ZERO,
        })
    }

    /// Persist a generated template.
    ///
    /// The store's uniqueness constraint decides the winner when several
    /// requests miss on the same canonical text; losers re-read and converge.
    async fn cache_generation(
        &self,
        canonical: &str,
        embedding: Vec<f32>,
        generated: &str,
    ) -> Result<MissKind, TranslateError> {
        let new_entry = NewCacheEntry {
            query_text: canonical.to_string(),
            embedding,
            promql_template: generated.to_string(),
        };

        match self.store.put(new_entry.clone()).await {
            Ok(id) => {
                match self.index.insert(id, &new_entry.embedding) {
                    Ok(()) => metrics::CACHE_ENTRIES.set(self.index.len() as i64),
                    Err(IndexError::DuplicateKey(_)) => {}
                    Err(e) => warn!(entry_id = id, error = %e, "cached entry not indexed"),
                }
                info!(entry_id = id, query = canonical, "cached new translation");
                Ok(MissKind::Created(id))
            }
            Err(StoreError::DuplicateKey(_)) => {
                let winner = self.store.get(canonical).await?;
                // The winner may have committed without reaching the index
                // (cancelled request, full index); repair it here
                match self.index.insert(winner.id, &winner.embedding) {
                    Ok(()) => {
                        metrics::CACHE_ENTRIES.set(self.index.len() as i64);
                        info!(entry_id = winner.id, "indexed previously unindexed entry");
                    }
                    Err(IndexError::DuplicateKey(_)) => {}
                    Err(e) => warn!(entry_id = winner.id, error = %e, "cached entry not indexed"),
                }
                self.counters.put_races.fetch_add(1, Ordering::Relaxed);
                metrics::PUT_RACES_TOTAL.inc();
                debug!(entry_id = winner.id, "canonical text already cached, converging");
                Ok(MissKind::Existing(winner))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn substitute(&self, template: &str, request: &TranslationRequest) -> Substitution {
        promql::substitute(
            template,
            &request.query,
            &request.context,
            request.time_range.as_deref(),
            self.registry.as_ref(),
        )
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, TranslateError> {
        let embedding = self
            .call_upstream(
                Collaborator::Embedder,
                &self.breakers.embedder,
                self.collaborators.embedder.embed(text),
            )
            .await?;

        let expected = self.index.dimension();
        if embedding.len() != expected {
            return Err(TranslateError::upstream(
                Collaborator::Embedder,
                UpstreamError::Unavailable(format!(
                    "embedding has dimension {}, expected {expected}",
                    embedding.len()
                )),
            ));
        }
        Ok(embedding)
    }

    /// Run the executor when enabled. Failures lower `confidence` and are
    /// appended to `explanation`; they never fail the request.
    async fn validate_promql(
        &self,
        promql: &str,
        enabled: bool,
        confidence: &mut f64,
        explanation: &mut String,
    ) -> Option<ExecutionOutcome> {
        let executor = match (&self.collaborators.executor, enabled) {
            (Some(executor), true) => Arc::clone(executor),
            _ => return None,
        };

        let started = Instant::now();
        let result = self
            .call_upstream(
                Collaborator::Executor,
                &self.breakers.executor,
                executor.execute(promql),
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => ExecutionOutcome::failed(
                started.elapsed().as_secs_f64() * 1000.0,
                err.to_string(),
            ),
        };

        if outcome.success {
            explanation.push_str(&format!(
                " Validated in {:.1} ms.",
                outcome.execution_time_ms
            ));
        } else {
            *confidence *= self.settings.failure_confidence_penalty;
            explanation.push_str(&format!(
                " Validation failed: {}.",
                outcome.error.as_deref().unwrap_or("unknown error")
            ));
        }
        Some(outcome)
    }

    async fn call_upstream<T, F>(
        &self,
        collaborator: Collaborator,
        breaker: &UpstreamBreaker,
        call: F,
    ) -> Result<T, TranslateError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        let timer = metrics::UPSTREAM_LATENCY_SECONDS
            .with_label_values(&[collaborator.as_str()])
            .start_timer();
        let result = breaker.call(call).await;
        timer.observe_duration();

        let status = match &result {
            Ok(_) => "ok",
            Err(UpstreamError::RateLimited { .. }) => "rate_limited",
            Err(UpstreamError::InvalidRequest(_)) => "invalid_request",
            Err(UpstreamError::Unavailable(_)) => "unavailable",
        };
        metrics::UPSTREAM_REQUESTS_TOTAL
            .with_label_values(&[collaborator.as_str(), status])
            .inc();

        result.map_err(|e| TranslateError::upstream(collaborator, e))
    }
}

fn note_unresolved(substitution: &Substitution, confidence: &mut f64, explanation: &mut String) {
    if !substitution.is_complete() {
        *confidence *= UNRESOLVED_PLACEHOLDER_FACTOR;
        explanation.push_str(&format!(
            " Unresolved placeholders: {}.",
            substitution.unresolved.join(", ")
        ));
    }
}
