//! Prometheus metrics for the mock engine.
//!
//! Tracks rule matching, cache tier activity, injected latency and response
//! generation.
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    /// Outcome of every find_match call
    pub static ref MATCH_TOTAL: CounterVec = register_counter_vec!(
        "shoal_match_total",
        "Total number of match attempts",
        &["result"]  // result: matched|unmatched|error
    )
    .unwrap();

    /// Cache lookups and writes per tier
    pub static ref CACHE_OPS_TOTAL: CounterVec = register_counter_vec!(
        "shoal_cache_ops_total",
        "Total number of cache operations per tier",
        &["tier", "result"]  // tier: l1|l2, result: hit|miss|set|error
    )
    .unwrap();

    pub static ref CACHE_PROMOTIONS_TOTAL: Counter = register_counter!(
        "shoal_cache_promotions_total",
        "Total number of L2 entries promoted into L1"
    )
    .unwrap();

    pub static ref CACHE_EVICTIONS_TOTAL: Counter = register_counter!(
        "shoal_cache_evictions_total",
        "Total number of L1 entries evicted to stay within budget"
    )
    .unwrap();

    /// Injected delay in milliseconds
    pub static ref DELAY_INJECTED_MS: Histogram = register_histogram!(
        "shoal_delay_injected_ms",
        "Histogram of injected response delay in milliseconds",
        vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    )
    .unwrap();

    pub static ref PROXY_FAILURES_TOTAL: Counter = register_counter!(
        "shoal_proxy_failures_total",
        "Total number of failed upstream calls for proxy responses"
    )
    .unwrap();

    /// Predicate evaluation failures (rule skipped)
    pub static ref RULE_EVAL_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "shoal_rule_eval_errors_total",
        "Total number of rule predicate evaluation errors",
        &["match_type"]  // match_type: simple|regex|script
    )
    .unwrap();

    pub static ref RESPONSES_TOTAL: CounterVec = register_counter_vec!(
        "shoal_responses_total",
        "Total number of responses generated",
        &["type", "status"]  // type: static|dynamic|proxy|script|default|degraded
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_match(result: &str) {
    MATCH_TOTAL.with_label_values(&[result]).inc();
}

/// Helper to record a cache operation on a tier
pub fn record_cache_op(tier: &str, result: &str) {
    CACHE_OPS_TOTAL.with_label_values(&[tier, result]).inc();
}

pub fn record_promotion() {
    CACHE_PROMOTIONS_TOTAL.inc();
}

pub fn record_evictions(count: usize) {
    if count > 0 {
        CACHE_EVICTIONS_TOTAL.inc_by(count as f64);
    }
}

pub fn record_delay(delay_ms: u64) {
    DELAY_INJECTED_MS.observe(delay_ms as f64);
}

pub fn record_proxy_failure() {
    PROXY_FAILURES_TOTAL.inc();
}

pub fn record_rule_eval_error(match_type: &str) {
    RULE_EVAL_ERRORS_TOTAL.with_label_values(&[match_type]).inc();
}

pub fn record_response(response_type: &str, status: u16) {
    RESPONSES_TOTAL
        .with_label_values(&[response_type, &status.to_string()])
        .inc();
}
