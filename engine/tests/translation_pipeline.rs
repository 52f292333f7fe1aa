//! End-to-end behaviour of the translation pipeline over the in-memory backends

mod common;

use common::{pipeline, pipeline_with, test_config, Pipeline};
use promcache_engine::{
    canonicalize, config::ValidationPolicy, registry::ServiceSeed, CacheEntry, CacheEntryStore,
    Collaborator, HistoryStore, MemoryCacheStore, NewCacheEntry, RingHistoryLog, TranslateError,
    TranslationRequest,
};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const CHECKOUT_QUERY: &str = "show me CPU usage for checkout-service";

fn seed_checkout(p: &Pipeline) {
    p.registry
        .upsert_service(ServiceSeed {
            name: "checkout-service".into(),
            namespace: "shop".into(),
            ..Default::default()
        })
        .unwrap();
}

async fn entry_for(p: &Pipeline, query: &str) -> CacheEntry {
    p.store.get(&canonicalize(query)).await.unwrap()
}

#[tokio::test]
async fn test_first_query_is_generated_cached_and_logged() {
    let p = pipeline(test_config());
    seed_checkout(&p);

    let result = p
        .orchestrator
        .translate(TranslationRequest::new(CHECKOUT_QUERY).with_user("alice"))
        .await
        .unwrap();

    assert!(!result.cache_hit);
    assert_eq!(
        result.promql,
        "sum(rate(container_cpu_usage_seconds_total{service=\"checkout-service\"}[5m]))"
    );
    assert!(result.estimated_cost > 0.0);
    assert_eq!(p.store.len().await.unwrap(), 1);
    assert_eq!(p.generator.calls.load(Ordering::SeqCst), 1);

    // The template is stored unresolved
    let entry = entry_for(&p, CHECKOUT_QUERY).await;
    assert_eq!(Some(entry.id), result.entry_id);
    assert!(entry.promql_template.contains("{{service}}"));

    p.settle().await;
    let history = p.history.recent(10).await.unwrap();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.natural_query, CHECKOUT_QUERY);
    assert!(!record.generated_promql.is_empty());
    assert!(record.success);
    assert!(!record.cache_hit);
    assert_eq!(record.cache_entry_id, Some(entry.id));
    assert_eq!(record.user_id.as_deref(), Some("alice"));
    assert_eq!(record.service_name.as_deref(), Some("checkout-service"));
}

#[tokio::test]
async fn test_repeat_query_hits_and_counts_one_success() {
    let p = pipeline(test_config());
    seed_checkout(&p);

    let first = p
        .orchestrator
        .translate(TranslationRequest::new(CHECKOUT_QUERY))
        .await
        .unwrap();
    p.settle().await;
    let before = entry_for(&p, CHECKOUT_QUERY).await;
    assert_eq!(before.success_count, 1, "validated miss records its outcome");

    let second = p
        .orchestrator
        .translate(TranslationRequest::new("Show me CPU usage for checkout-service?"))
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.entry_id, first.entry_id);
    assert_eq!(second.promql, first.promql);
    assert!(second.similarity.unwrap() > 0.99);
    assert_eq!(p.generator.calls.load(Ordering::SeqCst), 1);

    p.settle().await;
    let after = entry_for(&p, CHECKOUT_QUERY).await;
    assert_eq!(after.success_count, before.success_count + 1);
    assert_eq!(after.failure_count, 0);
    assert_eq!(p.orchestrator.stats().cache_hits, 1);
}

#[tokio::test]
async fn test_embedder_outage_fails_and_logs_without_mutating_entries() {
    let p = pipeline(test_config());

    p.orchestrator
        .translate(TranslationRequest::new("error rate of payments"))
        .await
        .unwrap();
    p.settle().await;
    let untouched = entry_for(&p, "error rate of payments").await;

    p.embedder.fail(true);
    let err = p
        .orchestrator
        .translate(TranslationRequest::new("error rate of payments"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TranslateError::UpstreamUnavailable {
            collaborator: Collaborator::Embedder,
            ..
        }
    ));
    assert_eq!(p.generator.calls.load(Ordering::SeqCst), 1);

    p.settle().await;
    let history = p.history.recent(1).await.unwrap();
    let record = &history[0];
    assert!(!record.success);
    let message = record.error_message.as_deref().unwrap();
    assert!(message.contains("embedder"), "{message}");

    assert_eq!(p.store.len().await.unwrap(), 1);
    assert_eq!(entry_for(&p, "error rate of payments").await, untouched);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_requests_create_one_entry() {
    let p = pipeline(test_config());
    // Every generator call yields a different template, so convergence
    // can only come from the store
    p.generator.number_calls();
    p.generator.set_delay(Duration::from_millis(30));

    let phrasings = [
        "p99 latency of the cart api",
        "P99 latency of the cart API?",
        "p99  latency of the cart api.",
        "p99 latency of the cart api",
    ];
    let mut handles = Vec::new();
    for round in 0..2 {
        for phrasing in phrasings {
            let orchestrator = Arc::clone(&p.orchestrator);
            handles.push(tokio::spawn(async move {
                orchestrator
                    .translate(TranslationRequest::new(phrasing).with_user(format!("u{round}")))
                    .await
            }));
        }
    }

    let mut templates = HashSet::new();
    let mut ids = HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        templates.insert(result.promql);
        ids.insert(result.entry_id);
    }

    assert_eq!(p.store.len().await.unwrap(), 1, "exactly one row");
    assert_eq!(templates.len(), 1, "all requests converge: {templates:?}");
    assert_eq!(ids.len(), 1);
    assert_eq!(p.orchestrator.index().len(), 1);

    let entry = entry_for(&p, "p99 latency of the cart api").await;
    assert!(templates.contains(&entry.promql_template));
}

#[tokio::test]
async fn test_distrusted_entry_is_bypassed_by_fresh_generation() {
    let mut config = test_config();
    config.executor.validation = ValidationPolicy::OnMiss;
    let p = pipeline(config);
    p.generator.push("sum(rate(broken_metric_total[5m]))");

    let first = p
        .orchestrator
        .translate(TranslationRequest::new("request throughput"))
        .await
        .unwrap();
    let id = first.entry_id.unwrap();
    for _ in 0..10 {
        p.orchestrator.report_execution(id, false, 5.0).await.unwrap();
    }
    p.settle().await;
    let before = entry_for(&p, "request throughput").await;

    p.generator.push("sum(rate(http_requests_total[5m]))");
    p.generator.push("sum(rate(http_requests_total[5m]))");
    for _ in 0..2 {
        let result = p
            .orchestrator
            .translate(TranslationRequest::new("Request throughput?"))
            .await
            .unwrap();
        assert!(!result.cache_hit);
        assert_eq!(result.promql, "sum(rate(http_requests_total[5m]))");
        assert_eq!(result.entry_id, None, "fresh generation is not tied to the old entry");
        assert!((result.confidence - 0.5).abs() < 1e-9, "{}", result.confidence);
        assert!(result.execution.as_ref().unwrap().success);
    }
    assert_eq!(p.generator.calls.load(Ordering::SeqCst), 3);
    assert_eq!(p.orchestrator.stats().uncached_generations, 2);

    // The old entry's record is left untouched by the bypassing requests
    p.settle().await;
    let after = entry_for(&p, "request throughput").await;
    assert_eq!(after.promql_template, "sum(rate(broken_metric_total[5m]))");
    assert_eq!(after.success_count, before.success_count);
    assert_eq!(after.failure_count, before.failure_count);
    assert_eq!(p.store.len().await.unwrap(), 1);

    let history = p.history.recent(2).await.unwrap();
    assert!(history.iter().all(|r| r.cache_entry_id.is_none() && r.success));
}

#[tokio::test]
async fn test_committed_but_unindexed_entry_is_repaired() {
    let p = pipeline(test_config());
    let embedding = {
        use promcache_engine::Embedder;
        p.embedder.embed("queue backlog").await.unwrap()
    };
    // Committed by a request that was cancelled before indexing
    let id = p
        .store
        .put(NewCacheEntry {
            query_text: "queue backlog".into(),
            embedding,
            promql_template: "sum(queue_backlog)".into(),
        })
        .await
        .unwrap();
    assert_eq!(p.orchestrator.index().len(), 0);

    let first = p
        .orchestrator
        .translate(TranslationRequest::new("queue backlog"))
        .await
        .unwrap();
    assert!(!first.cache_hit);
    assert_eq!(first.entry_id, Some(id));
    assert_eq!(first.promql, "sum(queue_backlog)");
    assert_eq!(p.orchestrator.index().len(), 1);
    p.settle().await;

    let second = p
        .orchestrator
        .translate(TranslationRequest::new("queue backlog"))
        .await
        .unwrap();
    assert!(second.cache_hit, "{second:?}");
    assert_eq!(second.entry_id, Some(id));
    assert_eq!(p.generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_validation_penalizes_and_records_failure() {
    let p = pipeline(test_config());
    p.executor.fail(true);

    let result = p
        .orchestrator
        .translate(TranslationRequest::new("disk usage").with_context("service", "db"))
        .await
        .unwrap();

    assert!(!result.cache_hit);
    assert!((result.confidence - 0.25).abs() < 1e-9, "{}", result.confidence);
    assert!(result.explanation.contains("Validation failed"));
    assert!(!result.execution.as_ref().unwrap().success);

    p.settle().await;
    let entry = entry_for(&p, "disk usage").await;
    assert_eq!(entry.success_count, 0);
    assert_eq!(entry.failure_count, 1);
    assert!((entry.avg_execution_time_ms - 4.0).abs() < 1e-9);

    let record = &p.history.recent(1).await.unwrap()[0];
    assert!(!record.success);
    assert!(record.error_message.as_deref().unwrap().contains("bad_data"));
}

#[tokio::test]
async fn test_unresolved_placeholders_are_reported() {
    let p = pipeline(test_config());

    let result = p
        .orchestrator
        .translate(TranslationRequest::new("cpu of something unknown"))
        .await
        .unwrap();
    assert!(result.promql.contains("{{service}}"));
    assert!(result.explanation.contains("Unresolved placeholders: service"));
    assert!((result.confidence - 0.4).abs() < 1e-9, "{}", result.confidence);
}

#[tokio::test]
async fn test_context_fills_placeholders_and_escapes_values() {
    let p = pipeline(test_config());
    p.generator
        .set_default("rate(http_requests_total{job=\"{{job}}\"}[{{time_range}}])");

    let result = p
        .orchestrator
        .translate(
            TranslationRequest::new("request rate for my job")
                .with_context("job", "api\"prod")
                .with_time_range("10m"),
        )
        .await
        .unwrap();
    assert_eq!(
        result.promql,
        "rate(http_requests_total{job=\"api\\\"prod\"}[10m])"
    );
}

#[tokio::test]
async fn test_invalid_requests_leave_no_trace() {
    let p = pipeline(test_config());

    let err = p
        .orchestrator
        .translate(TranslationRequest::new("  \t "))
        .await
        .unwrap_err();
    assert!(matches!(err, TranslateError::Validation(_)));

    p.settle().await;
    assert_eq!(p.history.len().await.unwrap(), 0);
    assert_eq!(p.embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_deferred_report_enables_reuse_without_executor() {
    let mut config = test_config();
    config.executor.validation = ValidationPolicy::OnMiss;
    let store: Arc<dyn CacheEntryStore> = Arc::new(MemoryCacheStore::new(common::DIM));
    let history: Arc<dyn HistoryStore> = Arc::new(RingHistoryLog::new(64));
    let p = pipeline_with(config, store, history, false);

    let first = p
        .orchestrator
        .translate(TranslationRequest::new("memory usage"))
        .await
        .unwrap();
    let id = first.entry_id.unwrap();

    p.orchestrator.report_execution(id, true, 30.0).await.unwrap();
    p.orchestrator.report_execution(id, true, 10.0).await.unwrap();
    p.settle().await;

    let entry = entry_for(&p, "memory usage").await;
    assert_eq!(entry.success_count, 2);
    assert!((entry.avg_execution_time_ms - 20.0).abs() < 1e-9);

    let second = p
        .orchestrator
        .translate(TranslationRequest::new("memory usage"))
        .await
        .unwrap();
    assert!(second.cache_hit);
}
