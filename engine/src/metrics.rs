use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

pub static TRANSLATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "promcache_translations_total",
        "Completed translations by cache result (hit, miss)",
        &["result"]
    )
    .expect("register promcache_translations_total")
});

pub static TRANSLATION_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "promcache_translation_errors_total",
        "Failed translations by error category",
        &["category"]
    )
    .expect("register promcache_translation_errors_total")
});

pub static TRANSLATION_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "promcache_translation_latency_seconds",
        "End-to-end translate latency in seconds",
    )
    .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]);
    prometheus::register_histogram!(opts).expect("register promcache_translation_latency_seconds")
});

pub static RETURNED_CONFIDENCE: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "promcache_returned_confidence",
        "Confidence attached to returned translations",
    )
    .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]);
    prometheus::register_histogram!(opts).expect("register promcache_returned_confidence")
});

pub static PUT_RACES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "promcache_put_races_total",
        "Inserts that lost a race for the same query text and converged on the winner"
    )
    .expect("register promcache_put_races_total")
});

pub static UPSTREAM_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "promcache_upstream_requests_total",
        "Calls to embedder, generator and executor by status",
        &["collaborator", "status"]
    )
    .expect("register promcache_upstream_requests_total")
});

pub static UPSTREAM_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "promcache_upstream_latency_seconds",
        "Upstream call latency in seconds",
    )
    .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]);
    prometheus::register_histogram_vec!(opts, &["collaborator"])
        .expect("register promcache_upstream_latency_seconds")
});

pub static BREAKER_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "promcache_breaker_rejections_total",
        "Upstream calls short-circuited by an open breaker",
        &["collaborator"]
    )
    .expect("register promcache_breaker_rejections_total")
});

pub static FEEDBACK_APPLIED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "promcache_feedback_applied_total",
        "Feedback events written to storage by kind (history, outcome)",
        &["kind"]
    )
    .expect("register promcache_feedback_applied_total")
});

pub static FEEDBACK_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "promcache_feedback_dropped_total",
        "Feedback events dropped because the queue was full or closed"
    )
    .expect("register promcache_feedback_dropped_total")
});

pub static FEEDBACK_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "promcache_feedback_failed_total",
        "Feedback events abandoned after a storage error"
    )
    .expect("register promcache_feedback_failed_total")
});

pub static FEEDBACK_CONFLICT_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "promcache_feedback_conflict_retries_total",
        "Statistic updates retried after a write conflict"
    )
    .expect("register promcache_feedback_conflict_retries_total")
});

pub static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("promcache_cache_entries", "Entries in the embedding index")
        .expect("register promcache_cache_entries")
});

pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let mf = prometheus::gather();
    if let Err(e) = encoder.encode(&mf, &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
