//! Prometheus metrics for the gateway.
//!
//! Counters are process-global and updated on the hot path; reads only happen
//! when `/metrics` is scraped.

use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Requests by endpoint, model and final status code
    pub request_count: IntCounterVec,

    /// Inbound request duration in seconds
    pub request_duration: HistogramVec,

    /// Upstream attempts by outcome (ok / retryable / fatal)
    pub upstream_attempts: IntCounterVec,

    /// Vision fallback activations by path (two_stage / direct / substitution)
    pub vision_fallbacks: IntCounterVec,

    /// Continuation hops issued after a truncated reply
    pub continuation_hops: IntCounterVec,

    /// Streams cancelled because the caller went away
    pub client_disconnects: IntCounterVec,

    /// Token usage by model and token type
    pub token_usage: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Safe to call repeatedly; later calls return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "iflow_proxy_requests_total",
            "Total number of inbound requests",
            &["endpoint", "model", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "iflow_proxy_request_duration_seconds",
            "Inbound request duration in seconds",
            &["endpoint", "model"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )
        .expect("Failed to register request_duration metric");

        let upstream_attempts = register_int_counter_vec!(
            "iflow_proxy_upstream_attempts_total",
            "Upstream call attempts by outcome",
            &["outcome"]
        )
        .expect("Failed to register upstream_attempts metric");

        let vision_fallbacks = register_int_counter_vec!(
            "iflow_proxy_vision_fallbacks_total",
            "Vision fallback activations",
            &["path"]
        )
        .expect("Failed to register vision_fallbacks metric");

        let continuation_hops = register_int_counter_vec!(
            "iflow_proxy_continuation_hops_total",
            "Continuation hops after truncated output",
            &["stream"]
        )
        .expect("Failed to register continuation_hops metric");

        let client_disconnects = register_int_counter_vec!(
            "iflow_proxy_client_disconnects_total",
            "Streams cancelled by client disconnect",
            &["endpoint"]
        )
        .expect("Failed to register client_disconnects metric");

        let token_usage = register_int_counter_vec!(
            "iflow_proxy_token_usage_total",
            "Token usage reported by the upstream",
            &["model", "token_type"]
        )
        .expect("Failed to register token_usage metric");

        Metrics {
            request_count,
            request_duration,
            upstream_attempts,
            vision_fallbacks,
            continuation_hops,
            client_disconnects,
            token_usage,
        }
    })
}

/// Get the metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Record prompt/completion token counts for a model.
pub fn record_token_usage(model: &str, prompt_tokens: u64, completion_tokens: u64) {
    let metrics = get_metrics();
    metrics
        .token_usage
        .with_label_values(&[model, "prompt"])
        .inc_by(prompt_tokens);
    metrics
        .token_usage
        .with_label_values(&[model, "completion"])
        .inc_by(completion_tokens);
}
