//! Timeouts, circuit breaking and rate limits on the external collaborators

mod common;

use common::{pipeline, test_config};
use promcache_engine::{
    config::ValidationPolicy, CacheEntryStore, Collaborator, HistoryStore, TranslateError,
    TranslationRequest, UpstreamError,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_request_deadline_is_enforced_and_logged() {
    let mut config = test_config();
    config.timeouts.request_ms = 50;
    let p = pipeline(config);
    p.generator.set_delay(Duration::from_millis(500));

    let err = p
        .orchestrator
        .translate(TranslationRequest::new("slow question"))
        .await
        .unwrap_err();
    assert!(matches!(err, TranslateError::Timeout(_)));
    assert_eq!(err.category(), "timeout");

    p.settle().await;
    let history = p.history.recent(5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert!(history[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("timed out"));
    assert_eq!(p.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_generator_breaker_opens_and_fails_fast() {
    let mut config = test_config();
    config.upstream.failure_threshold = 2;
    config.upstream.open_duration_secs = 60;
    let p = pipeline(config);
    p.generator
        .fail_with(Some(UpstreamError::Unavailable("connection refused".into())));

    for query in ["first question", "second question"] {
        let err = p
            .orchestrator
            .translate(TranslationRequest::new(query))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TranslateError::UpstreamUnavailable {
                collaborator: Collaborator::Generator,
                ..
            }
        ));
    }
    assert_eq!(p.generator.calls.load(Ordering::SeqCst), 2);

    let err = p
        .orchestrator
        .translate(TranslationRequest::new("third question"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("circuit open"), "{err}");
    assert_eq!(
        p.generator.calls.load(Ordering::SeqCst),
        2,
        "open breaker must not reach the generator"
    );

    // The embedder has its own breaker and keeps working
    assert_eq!(p.embedder.calls.load(Ordering::SeqCst), 3);

    p.settle().await;
    assert_eq!(p.history.len().await.unwrap(), 3);
    assert_eq!(p.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rate_limits_surface_but_do_not_trip_the_breaker() {
    let mut config = test_config();
    config.upstream.failure_threshold = 1;
    let p = pipeline(config);
    p.generator.fail_with(Some(UpstreamError::RateLimited {
        message: "quota exceeded".into(),
        retry_after: Some(Duration::from_secs(3)),
    }));

    for _ in 0..3 {
        let err = p
            .orchestrator
            .translate(TranslationRequest::new("anything"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "rate_limited");
    }
    assert_eq!(p.generator.calls.load(Ordering::SeqCst), 3);

    p.generator.fail_with(None);
    let ok = p
        .orchestrator
        .translate(TranslationRequest::new("anything"))
        .await
        .unwrap();
    assert!(!ok.cache_hit);
}

#[tokio::test]
async fn test_unreachable_executor_penalizes_but_still_answers() {
    use async_trait::async_trait;
    use promcache_engine::{
        Collaborators, ExecutionOutcome, Executor, FeedbackRecorder, InMemoryRegistry,
        LinearScanIndex, MemoryCacheStore, RingHistoryLog, TranslationOrchestrator,
    };
    use std::sync::Arc;

    struct DownExecutor;

    #[async_trait]
    impl Executor for DownExecutor {
        async fn execute(&self, _promql: &str) -> Result<ExecutionOutcome, UpstreamError> {
            Err(UpstreamError::Unavailable("prometheus unreachable".into()))
        }
    }

    let mut config = test_config();
    config.executor.validation = ValidationPolicy::OnMiss;
    let store: Arc<dyn CacheEntryStore> = Arc::new(MemoryCacheStore::new(common::DIM));
    let history: Arc<dyn HistoryStore> = Arc::new(RingHistoryLog::new(16));
    let feedback = Arc::new(FeedbackRecorder::spawn(
        store.clone(),
        history.clone(),
        &config.feedback,
    ));
    let embedder = Arc::new(common::ScriptedEmbedder::default());
    let generator = Arc::new(common::ScriptedGenerator::default());
    generator.set_default("up");
    let orchestrator = TranslationOrchestrator::new(
        &config,
        Arc::new(LinearScanIndex::new(common::DIM)),
        store.clone(),
        feedback.clone(),
        Arc::new(InMemoryRegistry::new()),
        Collaborators {
            embedder,
            generator,
            executor: Some(Arc::new(DownExecutor) as Arc<dyn Executor>),
        },
    );

    let result = orchestrator
        .translate(TranslationRequest::new("is it up"))
        .await
        .unwrap();
    assert_eq!(result.promql, "up");
    assert!((result.confidence - 0.25).abs() < 1e-9);
    assert!(result.explanation.contains("prometheus unreachable"));

    feedback.flush().await;
    let entry = store.get("is it up").await.unwrap();
    assert_eq!(entry.failure_count, 1);
}
