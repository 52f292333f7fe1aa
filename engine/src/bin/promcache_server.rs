//! PromCache HTTP server
//!
//! Translates natural-language monitoring questions into PromQL, reusing
//! cached translations whose track record earns enough confidence.
//!
//! # Usage
//! ```bash
//! # Start server with default config
//! promcache_server
//!
//! # With custom config
//! promcache_server --config promcache.yaml
//!
//! # With verbose logging
//! RUST_LOG=promcache_engine=debug promcache_server
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use promcache_engine::{
    config::{self, LogFormat, PromCacheConfig},
    http_api::{self, AppState},
    index::{build_index, load_entries, EmbeddingIndex},
    metrics,
    registry::{InMemoryRegistry, ServiceRegistry},
    store::open_stores,
    upstream::{ChatGenerator, Executor, OpenAiEmbedder, PrometheusExecutor},
    Collaborators, FeedbackRecorder, TranslationOrchestrator,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

/// PromCache - semantic cache for natural-language PromQL translation
#[derive(Parser, Debug)]
#[command(name = "promcache_server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "HTTP server for the PromCache translation cache", long_about = None)]
struct CliArgs {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, env = "PROMCACHE_CONFIG")]
    config: Option<String>,

    /// Override HTTP server port
    #[arg(short, long, env = "PROMCACHE_PORT")]
    port: Option<u16>,

    /// Override the registry seed file
    #[arg(long)]
    registry: Option<String>,

    /// Generate example config file (yaml or toml) and exit
    #[arg(long, value_name = "FORMAT")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    if let Some(format) = cli_args.generate_config {
        match format.to_lowercase().as_str() {
            "yaml" | "yml" => {
                println!("{}", config::generate_example_yaml());
                return Ok(());
            }
            "toml" => {
                println!("{}", config::generate_example_toml());
                return Ok(());
            }
            _ => {
                eprintln!("Error: Invalid format '{}'. Use 'yaml' or 'toml'.", format);
                std::process::exit(1);
            }
        }
    }

    // Priority: CLI args > env vars > config file > defaults
    let mut config = PromCacheConfig::load(cli_args.config.as_deref())?;
    if let Some(port) = cli_args.port {
        config.server.port = port;
    }
    if let Some(seed) = cli_args.registry {
        config.registry.seed_file = Some(seed.into());
    }
    config.validate()?;

    let _log_guard = init_tracing(&config);

    info!("Starting PromCache server v{}", env!("CARGO_PKG_VERSION"));
    info!("Git commit: {}", env!("GIT_COMMIT_HASH"));
    info!("Build target: {}", env!("TARGET_TRIPLE"));
    info!(
        port = config.server.port,
        embedding_dimension = config.cache.embedding_dimension,
        top_k = config.cache.top_k,
        similarity_threshold = config.cache.similarity_threshold,
        confidence_threshold = config.cache.confidence_threshold,
        index_backend = ?config.index.backend,
        storage_backend = ?config.storage.backend,
        validation = ?config.executor.validation,
        log_level = config.logging.level.as_str(),
        "Configuration loaded"
    );

    let dimension = config.cache.embedding_dimension;
    let (store, history) =
        open_stores(&config.storage, dimension).context("Failed to open storage")?;

    let index: Arc<dyn EmbeddingIndex> = Arc::from(
        build_index(&config.index, dimension).context("Failed to build embedding index")?,
    );
    let entries = store
        .list_entries()
        .await
        .context("Failed to list cached entries")?;
    let loaded = load_entries(index.as_ref(), &entries).context("Failed to load index")?;
    metrics::CACHE_ENTRIES.set(index.len() as i64);
    info!(
        backend = index.name(),
        store = store.name(),
        entries = loaded,
        "Embedding index rebuilt from store"
    );

    let registry: Arc<dyn ServiceRegistry> = match &config.registry.seed_file {
        Some(path) => {
            let registry = InMemoryRegistry::from_seed_file(path)?;
            let snapshot = registry.snapshot();
            info!(
                services = snapshot.len(),
                metrics = snapshot.metric_count(),
                path = %path.display(),
                "Registry seeded"
            );
            Arc::new(registry)
        }
        None => {
            warn!("No registry seed file configured; generator gets no service context");
            Arc::new(InMemoryRegistry::new())
        }
    };

    let collaborators = build_collaborators(&config)?;
    let feedback = Arc::new(FeedbackRecorder::spawn(
        store.clone(),
        history.clone(),
        &config.feedback,
    ));
    let orchestrator = Arc::new(TranslationOrchestrator::new(
        &config,
        index,
        store,
        feedback.clone(),
        registry,
        collaborators,
    ));

    let app = http_api::router(AppState::new(orchestrator, history));
    let addr = format!("{}:{}", config.server.host, config.server.port)
        .parse::<std::net::SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {addr}"))?;

    info!("HTTP server listening on http://{}", addr);
    info!("  POST /api/v1/query     - Translate a query");
    info!("  POST /api/v1/feedback  - Report an execution");
    info!("  GET  /api/v1/history   - Recent translations");
    info!("  GET  /api/v1/stats     - Pipeline counters");
    info!("  GET  /metrics          - Prometheus metrics");
    info!("  GET  /health           - Liveness probe");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server failed");
    }

    info!("Draining feedback queue...");
    if tokio::time::timeout(config.shutdown_timeout(), feedback.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.server.shutdown_timeout_secs,
            "Feedback drain timed out; pending updates lost"
        );
    }
    let stats = feedback.stats();
    info!(
        applied = stats.outcomes_applied,
        history = stats.history_appended,
        dropped = stats.dropped,
        failed = stats.failed,
        "PromCache server stopped"
    );

    served.context("HTTP server error")
}

/// Install the global subscriber; the guard must live until exit to flush logs
fn init_tracing(config: &PromCacheConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let (non_blocking, guard) = if let Some(log_file) = &config.logging.file {
        match std::fs::File::create(log_file) {
            Ok(file) => tracing_appender::non_blocking(file),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to create log file {:?}: {}. Falling back to stdout.",
                    log_file, e
                );
                tracing_appender::non_blocking(std::io::stdout())
            }
        }
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };

    let log_level = config.logging.level.as_str();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "promcache_engine={},promcache_server={},tower_http={}",
            log_level, log_level, log_level
        )
        .into()
    });

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .json()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
    }
    guard
}

fn build_collaborators(config: &PromCacheConfig) -> Result<Collaborators> {
    let upstream = &config.upstream;
    let timeout = config.upstream_timeout();
    let api_key = std::env::var(&upstream.api_key_env).ok();
    if api_key.is_none() {
        warn!(
            env = %upstream.api_key_env,
            "No API key in environment; upstream requests are unauthenticated"
        );
    }

    let embedder = OpenAiEmbedder::new(
        &upstream.embedder_url,
        &upstream.embedder_model,
        api_key.clone(),
        timeout,
    )?;
    let generator = ChatGenerator::new(
        &upstream.generator_url,
        &upstream.generator_model,
        api_key,
        timeout,
    )?;
    let executor: Option<Arc<dyn Executor>> = match &upstream.prometheus_url {
        Some(url) => Some(Arc::new(PrometheusExecutor::new(url, timeout)?)),
        None => {
            info!("No prometheus_url configured; validation disabled");
            None
        }
    };

    Ok(Collaborators {
        embedder: Arc::new(embedder),
        generator: Arc::new(generator),
        executor,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
