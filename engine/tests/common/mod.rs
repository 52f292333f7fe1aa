//! Scripted collaborators and a pipeline builder shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use promcache_engine::{
    canonicalize, config::ValidationPolicy, CacheEntryStore, Collaborators, Embedder,
    ExecutionOutcome, Executor, FeedbackRecorder, Generation, Generator, HistoryStore,
    InMemoryRegistry, LinearScanIndex, MemoryCacheStore, PromCacheConfig, RegistryContext,
    RingHistoryLog, TranslationOrchestrator, UpstreamError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DIM: usize = 4;

/// Embeds canonical text through a lookup table; unknown text gets a vector
/// derived from its bytes so distinct queries stay distinct
#[derive(Default)]
pub struct ScriptedEmbedder {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    failing: AtomicBool,
    pub calls: AtomicUsize,
}

impl ScriptedEmbedder {
    /// Register the vector for a query (canonicalized before storing)
    pub fn set(&self, query: &str, vector: Vec<f32>) {
        self.vectors.lock().insert(canonicalize(query), vector);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn fallback(text: &str) -> Vec<f32> {
        let mut v = vec![0.1f32; DIM];
        for (i, b) in text.bytes().enumerate() {
            v[i % DIM] += f32::from(b) * (i as f32 + 1.0);
        }
        v
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unavailable("embedding service down".into()));
        }
        Ok(self
            .vectors
            .lock()
            .get(text)
            .cloned()
            .unwrap_or_else(|| Self::fallback(text)))
    }
}

/// Returns queued templates in order, then the default; optionally slow
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<String>>,
    default_template: Mutex<String>,
    numbered: AtomicBool,
    delay: Mutex<Duration>,
    failure: Mutex<Option<UpstreamError>>,
    pub calls: AtomicUsize,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            default_template: Mutex::new(
                "sum(rate(container_cpu_usage_seconds_total{service=\"{{service}}\"}[5m]))"
                    .to_string(),
            ),
            numbered: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedGenerator {
    pub fn push(&self, template: &str) {
        self.queue.lock().push_back(template.to_string());
    }

    pub fn set_default(&self, template: &str) {
        *self.default_template.lock() = template.to_string();
    }

    /// Make every call return a distinct template (`up{call="N"}`)
    pub fn number_calls(&self) {
        self.numbered.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_with(&self, error: Option<UpstreamError>) {
        *self.failure.lock() = error;
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        _query: &str,
        _context: &RegistryContext,
    ) -> Result<Generation, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if self.numbered.load(Ordering::SeqCst) {
            return Ok(Generation::new(format!("up{{call=\"{call}\"}}")));
        }
        let template = self
            .queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_template.lock().clone());
        Ok(Generation::new(template))
    }
}

/// Succeeds unless told otherwise; records every query it ran
#[derive(Default)]
pub struct ScriptedExecutor {
    failing: AtomicBool,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.executed.lock().len()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, promql: &str) -> Result<ExecutionOutcome, UpstreamError> {
        self.executed.lock().push(promql.to_string());
        if self.failing.load(Ordering::SeqCst) {
            Ok(ExecutionOutcome::failed(4.0, "bad_data: parse error"))
        } else {
            Ok(ExecutionOutcome::succeeded(8.0))
        }
    }
}

pub struct Pipeline {
    pub orchestrator: Arc<TranslationOrchestrator>,
    pub store: Arc<dyn CacheEntryStore>,
    pub history: Arc<dyn HistoryStore>,
    pub registry: Arc<InMemoryRegistry>,
    pub embedder: Arc<ScriptedEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
    pub executor: Arc<ScriptedExecutor>,
}

impl Pipeline {
    /// Wait for queued outcomes and history records to land
    pub async fn settle(&self) {
        self.orchestrator.feedback().flush().await;
    }
}

pub fn test_config() -> PromCacheConfig {
    let mut config = PromCacheConfig::default();
    config.cache.embedding_dimension = DIM;
    config.executor.validation = ValidationPolicy::Always;
    config
}

/// In-memory pipeline with a linear index
pub fn pipeline(config: PromCacheConfig) -> Pipeline {
    let store: Arc<dyn CacheEntryStore> =
        Arc::new(MemoryCacheStore::new(config.cache.embedding_dimension));
    let history: Arc<dyn HistoryStore> = Arc::new(RingHistoryLog::new(1024));
    pipeline_with(config, store, history, true)
}

pub fn pipeline_with(
    config: PromCacheConfig,
    store: Arc<dyn CacheEntryStore>,
    history: Arc<dyn HistoryStore>,
    with_executor: bool,
) -> Pipeline {
    let embedder = Arc::new(ScriptedEmbedder::default());
    let generator = Arc::new(ScriptedGenerator::default());
    let executor = Arc::new(ScriptedExecutor::default());
    let registry = Arc::new(InMemoryRegistry::new());

    let feedback = Arc::new(FeedbackRecorder::spawn(
        store.clone(),
        history.clone(),
        &config.feedback,
    ));
    let collaborators = Collaborators {
        embedder: embedder.clone(),
        generator: generator.clone(),
        executor: if with_executor {
            Some(executor.clone() as Arc<dyn Executor>)
        } else {
            None
        },
    };
    let orchestrator = Arc::new(TranslationOrchestrator::new(
        &config,
        Arc::new(LinearScanIndex::new(config.cache.embedding_dimension)),
        store.clone(),
        feedback,
        registry.clone(),
        collaborators,
    ));

    Pipeline {
        orchestrator,
        store,
        history,
        registry,
        embedder,
        generator,
        executor,
    }
}
