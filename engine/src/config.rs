// engine/src/config.rs
//
// Configuration Management Module
//
// Priority order (highest to lowest):
// 1. Command-line overrides (applied by the server binary after load())
// 2. Environment variables (PROMCACHE__* prefix)
// 3. Config file (YAML/TOML)
// 4. Built-in defaults
//
// The similarity/confidence thresholds and smoothing priors live here rather
// than in code so deployments can tune them against their own traffic.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Main Configuration Structure
// ============================================================================

/// Complete PromCache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PromCacheConfig {
    /// HTTP API server
    pub server: ServerConfig,

    /// Semantic cache decision parameters
    pub cache: CacheConfig,

    /// Embedding index backend
    pub index: IndexConfig,

    /// Cache entry / history storage
    pub storage: StorageConfig,

    /// Background feedback recorder
    pub feedback: FeedbackConfig,

    /// PromQL validation policy
    pub executor: ExecutorConfig,

    /// Embedder / Generator / Executor endpoints and circuit breaking
    pub upstream: UpstreamConfig,

    /// Request deadlines
    pub timeouts: TimeoutConfig,

    /// Service/metric registry
    pub registry: RegistryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

// ============================================================================
// Server Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind host (IPv4 or IPv6)
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Graceful shutdown timeout (seconds)
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout_secs: 30,
        }
    }
}

// ============================================================================
// Cache Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Embedding dimension; constant across all entries
    pub embedding_dimension: usize,

    /// Number of neighbours fetched per lookup
    pub top_k: usize,

    /// Minimum cosine similarity for a neighbour to be considered (T_sim)
    pub similarity_threshold: f32,

    /// Derived confidence a neighbour must exceed to be reused (T_conf)
    pub confidence_threshold: f64,

    /// Pseudo-successes added to every entry's history (Laplace alpha)
    pub prior_successes: f64,

    /// Pseudo-failures added to every entry's history (Laplace beta)
    pub prior_failures: f64,

    /// Confidence reported for fresh generations when the generator gives none
    pub default_generation_confidence: f64,

    /// Longest accepted natural-language query (characters)
    pub max_query_length: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: 1536,
            top_k: 3,
            similarity_threshold: 0.85,
            confidence_threshold: 0.6,
            prior_successes: 1.0,
            prior_failures: 1.0,
            default_generation_confidence: 0.5,
            max_query_length: 2000,
        }
    }
}

// ============================================================================
// Index Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    /// Exact linear scan (small deployments)
    Linear,
    /// Approximate HNSW graph
    Hnsw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    pub backend: IndexBackend,

    /// Maximum number of vectors in the HNSW graph
    pub max_elements: usize,

    /// Number of bidirectional links per node (M parameter)
    pub m: usize,

    /// Size of dynamic candidate list during construction
    pub ef_construction: usize,

    /// Fixed ef_search; adaptive when unset
    pub ef_search: Option<usize>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Linear,
            max_elements: 1_000_000,
            m: 16,
            ef_construction: 200,
            ef_search: None,
        }
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local maps; lost on restart
    Memory,
    /// SQLite database file
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// SQLite database path (sqlite backend only)
    pub sqlite_path: PathBuf,

    /// SQLite busy timeout before a write reports a conflict (milliseconds)
    pub busy_timeout_ms: u64,

    /// History ring buffer capacity (memory backend only)
    pub history_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            sqlite_path: PathBuf::from("./data/promcache.db"),
            busy_timeout_ms: 50,
            history_capacity: 100_000,
        }
    }
}

// ============================================================================
// Feedback Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedbackConfig {
    /// Pending history/outcome messages before new ones are dropped
    pub queue_capacity: usize,

    /// Attempts for a conflicting statistics update before it is skipped
    pub max_retries: u32,

    /// Base delay for exponential backoff between attempts (milliseconds)
    pub retry_base_ms: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            max_retries: 5,
            retry_base_ms: 10,
        }
    }
}

impl FeedbackConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}

// ============================================================================
// Executor Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Validate every translation
    Always,
    /// Validate only freshly generated PromQL
    OnMiss,
    /// Never validate; callers report executions through the deferred callback
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub validation: ValidationPolicy,

    /// Multiplier applied to confidence when validation fails (0.0-1.0]
    pub failure_confidence_penalty: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            validation: ValidationPolicy::Always,
            failure_confidence_penalty: 0.5,
        }
    }
}

// ============================================================================
// Upstream Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// OpenAI-compatible embeddings endpoint
    pub embedder_url: String,
    pub embedder_model: String,

    /// OpenAI-compatible chat completions endpoint
    pub generator_url: String,
    pub generator_model: String,

    /// Environment variable holding the bearer token for embedder/generator
    pub api_key_env: String,

    /// Prometheus base URL used for validation; validation disabled when unset
    pub prometheus_url: Option<String>,

    /// Consecutive failures before a collaborator's breaker opens
    pub failure_threshold: usize,

    /// Seconds an open breaker fails fast before a half-open probe
    pub open_duration_secs: u64,

    /// Failure counting window (seconds)
    pub window_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            embedder_url: "http://127.0.0.1:11434/v1/embeddings".to_string(),
            embedder_model: "text-embedding-3-small".to_string(),
            generator_url: "http://127.0.0.1:11434/v1/chat/completions".to_string(),
            generator_model: "gpt-4o-mini".to_string(),
            api_key_env: "PROMCACHE_API_KEY".to_string(),
            prometheus_url: None,
            failure_threshold: 5,
            open_duration_secs: 30,
            window_secs: 60,
        }
    }
}

// ============================================================================
// Timeout Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// End-to-end deadline for one translation (milliseconds)
    pub request_ms: u64,

    /// Per-call HTTP timeout for upstream clients (milliseconds)
    pub upstream_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 30_000,
            upstream_ms: 10_000,
        }
    }
}

// ============================================================================
// Registry Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// YAML file with services and metrics loaded at startup
    pub seed_file: Option<PathBuf>,

    /// Upper bound on services passed to the generator as context
    pub max_context_services: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            seed_file: None,
            max_context_services: 20,
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: LogLevel,

    /// Log format (json or text)
    pub format: LogFormat,

    /// Log to file (path, or None for stdout only)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format (for log aggregation)
    Json,
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl PromCacheConfig {
    /// Load configuration with priority chain:
    /// 1. Environment variables (PROMCACHE__*)
    /// 2. Config file (if provided)
    /// 3. Built-in defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let defaults = Self::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize defaults")?;
        builder = builder.add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PROMCACHE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().context("Failed to build config")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be > 0, got {}",
            self.server.port
        );

        // Cache decision parameters
        anyhow::ensure!(
            self.cache.embedding_dimension > 0,
            "cache.embedding_dimension must be > 0"
        );
        anyhow::ensure!(self.cache.top_k >= 1, "cache.top_k must be >= 1");
        anyhow::ensure!(
            self.cache.similarity_threshold > 0.0 && self.cache.similarity_threshold <= 1.0,
            "cache.similarity_threshold must be in (0.0, 1.0], got {}",
            self.cache.similarity_threshold
        );
        anyhow::ensure!(
            self.cache.confidence_threshold > 0.0 && self.cache.confidence_threshold < 1.0,
            "cache.confidence_threshold must be in (0.0, 1.0), got {}",
            self.cache.confidence_threshold
        );
        anyhow::ensure!(
            self.cache.prior_successes > 0.0 && self.cache.prior_failures > 0.0,
            "cache.prior_successes and cache.prior_failures must be > 0"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.cache.default_generation_confidence),
            "cache.default_generation_confidence must be in [0.0, 1.0]"
        );
        anyhow::ensure!(
            self.cache.max_query_length > 0,
            "cache.max_query_length must be > 0"
        );

        // Index parameters
        anyhow::ensure!(
            self.index.max_elements > 0,
            "index.max_elements must be > 0"
        );
        anyhow::ensure!(
            (5..=48).contains(&self.index.m),
            "index.m must be between 5 and 48, got {}",
            self.index.m
        );
        anyhow::ensure!(
            self.index.ef_construction >= self.index.m,
            "index.ef_construction ({}) must be >= index.m ({})",
            self.index.ef_construction,
            self.index.m
        );
        if let Some(ef) = self.index.ef_search {
            anyhow::ensure!(ef > 0, "index.ef_search must be > 0 when set");
        }

        // Storage
        if self.storage.backend == StorageBackend::Sqlite {
            anyhow::ensure!(
                !self.storage.sqlite_path.as_os_str().is_empty(),
                "storage.sqlite_path cannot be empty for the sqlite backend"
            );
        }
        anyhow::ensure!(
            self.storage.history_capacity > 0,
            "storage.history_capacity must be > 0"
        );

        // Feedback
        anyhow::ensure!(
            self.feedback.queue_capacity > 0,
            "feedback.queue_capacity must be > 0"
        );
        anyhow::ensure!(
            self.feedback.max_retries >= 1,
            "feedback.max_retries must be >= 1"
        );

        // Executor
        anyhow::ensure!(
            self.executor.failure_confidence_penalty > 0.0
                && self.executor.failure_confidence_penalty <= 1.0,
            "executor.failure_confidence_penalty must be in (0.0, 1.0], got {}",
            self.executor.failure_confidence_penalty
        );

        // Upstream
        anyhow::ensure!(
            self.upstream.failure_threshold > 0,
            "upstream.failure_threshold must be > 0"
        );
        anyhow::ensure!(
            !self.upstream.embedder_url.trim().is_empty(),
            "upstream.embedder_url cannot be empty"
        );
        anyhow::ensure!(
            !self.upstream.generator_url.trim().is_empty(),
            "upstream.generator_url cannot be empty"
        );

        // Timeouts
        anyhow::ensure!(self.timeouts.request_ms > 0, "timeouts.request_ms must be > 0");
        anyhow::ensure!(
            self.timeouts.upstream_ms > 0,
            "timeouts.upstream_ms must be > 0"
        );

        anyhow::ensure!(
            self.registry.max_context_services > 0,
            "registry.max_context_services must be > 0"
        );

        Ok(())
    }

    /// Get request deadline as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    /// Get upstream HTTP timeout as Duration
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.upstream_ms)
    }

    /// Get graceful shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get circuit breaker open duration
    pub fn breaker_open_duration(&self) -> Duration {
        Duration::from_secs(self.upstream.open_duration_secs)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Generate YAML config with default values.
///
/// # Example
/// ```bash
/// promcache_server --generate-config yaml > promcache.yaml
/// ```
pub fn generate_example_yaml() -> String {
    let config = PromCacheConfig::default();
    match serde_yaml::to_string(&config) {
        Ok(serialized) => serialized,
        Err(error) => format!("# failed to serialize default config to YAML: {error}\n"),
    }
}

/// Generate TOML config with default values.
pub fn generate_example_toml() -> String {
    let config = PromCacheConfig::default();
    match toml::to_string_pretty(&config) {
        Ok(serialized) => serialized,
        Err(error) => format!("# failed to serialize default config to TOML: {error}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = PromCacheConfig::default();
        config.validate().expect("Default config should be valid");
    }

    #[test]
    fn test_threshold_ranges() {
        let mut config = PromCacheConfig::default();
        config.cache.similarity_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = PromCacheConfig::default();
        config.cache.similarity_threshold = 1.2;
        assert!(config.validate().is_err());

        let mut config = PromCacheConfig::default();
        config.cache.confidence_threshold = 1.0;
        assert!(config.validate().is_err(), "T_conf of 1.0 can never be exceeded");
    }

    #[test]
    fn test_top_k_and_priors() {
        let mut config = PromCacheConfig::default();
        config.cache.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = PromCacheConfig::default();
        config.cache.prior_failures = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hnsw_m_parameter_range() {
        let mut config = PromCacheConfig::default();

        config.index.m = 4;
        assert!(config.validate().is_err(), "M < 5 should fail");

        config.index.m = 50;
        assert!(config.validate().is_err(), "M > 48 should fail");

        config.index.m = 16;
        assert!(config.validate().is_ok(), "M = 16 should pass");
    }

    #[test]
    fn test_hnsw_ef_construction_vs_m() {
        let mut config = PromCacheConfig::default();
        config.index.m = 20;
        config.index.ef_construction = 15;
        assert!(config.validate().is_err(), "ef_construction < M should fail");
    }

    #[test]
    fn test_penalty_range() {
        let mut config = PromCacheConfig::default();
        config.executor.failure_confidence_penalty = 0.0;
        assert!(config.validate().is_err());
        config.executor.failure_confidence_penalty = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_conversions() {
        let config = PromCacheConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.upstream_timeout(), Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.breaker_open_duration(), Duration::from_secs(30));
        assert_eq!(config.feedback.retry_base(), Duration::from_millis(10));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogLevel::Error.as_str(), "error");
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("promcache.yaml");
        std::fs::write(
            &path,
            "cache:\n  similarity_threshold: 0.9\n  top_k: 5\nindex:\n  backend: hnsw\n",
        )
        .unwrap();

        let config = PromCacheConfig::load(path.to_str()).unwrap();
        assert!((config.cache.similarity_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.cache.top_k, 5);
        assert_eq!(config.index.backend, IndexBackend::Hnsw);
        // Untouched sections keep their defaults
        assert_eq!(config.feedback.max_retries, 5);
    }

    #[test]
    fn test_generated_examples_parse_back() {
        let yaml = generate_example_yaml();
        let parsed: PromCacheConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.cache.top_k, PromCacheConfig::default().cache.top_k);

        let toml_text = generate_example_toml();
        assert!(toml_text.contains("[cache]"));
    }
}
