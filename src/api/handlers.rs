//! HTTP request handlers for the gateway.
//!
//! This module contains the Protocol-A chat/completions endpoint plus the
//! model catalog, health checks and metrics. The Messages endpoints live in
//! [`crate::api::claude`].

use crate::api::streaming::{sse_response, StreamOutcome};
use crate::core::config::AppConfig;
use crate::core::error::AppError;
use crate::core::header_policy::sanitize_headers;
use crate::core::logging::{generate_request_id, get_request_id};
use crate::core::metrics::record_token_usage;
use crate::core::request_logger::{ObservabilitySink, RequestLogEntry};
use crate::services::compressor::{
    compress_request, estimate_message_tokens, CompressionStrategy, SlidingWindowCompressor,
};
use crate::services::system_prompt::operational_prompt;
use crate::services::{thinking, ContinuationController, UpstreamClient};
use crate::transformer::stream::StreamUsage;
use crate::transformer::{CanonicalRequest, ChunkAccumulator, Message, Protocol};
use crate::with_request_context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const SERVICE_NAME: &str = "iflow-proxy-rust";

/// Models the upstream serves but does not always list.
static STATIC_MODELS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "glm-4.7",
        "glm-4.6",
        "iFlow-ROME-30BA3B",
        "deepseek-v3.2-chat",
        "deepseek-r1",
        "deepseek-v3",
        "qwen3-coder-plus",
        "qwen3-max",
        "qwen3-235b",
        "qwen3-vl-plus",
        "kimi-k2-thinking",
        "kimi-k2-0905",
        "minimax-m2.1",
        "tstars2.0",
    ]
});

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: Arc<UpstreamClient>,
    pub continuation: Arc<ContinuationController>,
    pub sink: Arc<dyn ObservabilitySink>,
    pub compressor: Arc<dyn CompressionStrategy>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        upstream: Arc<UpstreamClient>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        let continuation = Arc::new(ContinuationController::new(
            upstream.clone(),
            config.budgets.max_continuations,
        ));
        Self {
            config,
            upstream,
            continuation,
            sink,
            compressor: Arc::new(SlidingWindowCompressor),
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn CompressionStrategy>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Resolve reasoning configuration and fit the conversation into the
    /// context budget.
    pub fn prepare_request(&self, request: &mut CanonicalRequest) {
        thinking::resolve(request);
        if self.config.budgets.compression_enabled {
            // The operational prompt is injected after compression.
            let reserved = if self.config.models.inject_system_prompt {
                estimate_message_tokens(&Message::system(operational_prompt()))
            } else {
                0
            };
            compress_request(
                request,
                self.config.budgets.context_token_budget,
                reserved,
                self.compressor.as_ref(),
            );
        }
    }
}

// ============================================================================
// Request log helpers
// ============================================================================

/// Start a log entry for an inbound call.
pub(crate) fn begin_entry(path: &str, request_id: &str, headers: &HeaderMap, body: &Bytes) -> RequestLogEntry {
    let mut entry = RequestLogEntry::new(path, request_id);
    entry.headers = sanitize_headers(headers);
    entry.body = Some(String::from_utf8_lossy(body).into_owned());
    entry
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

/// Record a failed call and render the caller's error envelope.
pub(crate) fn fail(
    sink: &dyn ObservabilitySink,
    mut entry: RequestLogEntry,
    started: Instant,
    protocol: Protocol,
    err: AppError,
) -> Response {
    tracing::error!(
        request_id = %get_request_id(),
        model = %entry.model,
        status = err.status_code().as_u16(),
        error = %err,
        "Request failed"
    );
    entry.status = err.status_code().as_u16();
    entry.upstream_status = err.upstream_status().or(entry.upstream_status);
    entry.error = Some(err.to_string());
    entry.latency_ms = started.elapsed().as_millis() as u64;
    sink.record(entry);
    err.into_protocol_response(protocol)
}

/// Fill in a streamed call's log entry once its pump has finished.
pub(crate) fn finish_stream_entry(
    mut entry: RequestLogEntry,
    started: Instant,
    tap: &Mutex<ChunkAccumulator>,
    outcome: StreamOutcome,
) -> RequestLogEntry {
    entry.latency_ms = started.elapsed().as_millis() as u64;
    if let Ok(acc) = tap.lock() {
        entry.content = non_empty(&acc.content);
        entry.reasoning = non_empty(&acc.reasoning);
        if let Some(usage) = acc.usage {
            record_token_usage(&entry.effective_model, usage.prompt_tokens, usage.completion_tokens);
        }
    }
    entry.status = if outcome.error.is_some() {
        StatusCode::BAD_GATEWAY.as_u16()
    } else {
        StatusCode::OK.as_u16()
    };
    entry.error = match (outcome.error, outcome.cancelled) {
        (Some(err), _) => Some(err),
        (None, true) => Some("client disconnected".to_string()),
        (None, false) => None,
    };
    entry
}

/// Log fields and token metrics for a completed non-stream reply.
pub(crate) fn finish_completion_entry(entry: &mut RequestLogEntry, started: Instant, body: &Value) {
    entry.status = StatusCode::OK.as_u16();
    entry.upstream_status = Some(StatusCode::OK.as_u16());
    entry.latency_ms = started.elapsed().as_millis() as u64;
    if let Some(message) = body.pointer("/choices/0/message") {
        entry.content = message
            .get("content")
            .and_then(Value::as_str)
            .and_then(non_empty);
        entry.reasoning = message
            .get("reasoning_content")
            .and_then(Value::as_str)
            .and_then(non_empty);
    }
    if let Some(usage) = body.get("usage").and_then(StreamUsage::from_value) {
        record_token_usage(&entry.effective_model, usage.prompt_tokens, usage.completion_tokens);
    }
}

// ============================================================================
// Chat completions
// ============================================================================

/// Handle chat completion requests.
///
/// Supports both streaming and non-streaming responses. Replies cut off by
/// length are continued transparently in both modes.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = generate_request_id();

    with_request_context!(request_id.clone(), CHAT_COMPLETIONS_PATH.to_string(), async move {
        let started = Instant::now();
        let mut entry = begin_entry(CHAT_COMPLETIONS_PATH, &request_id, &headers, &body);
        let sink = state.sink.as_ref();

        let value: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                let err = AppError::InvalidRequest(format!("Invalid JSON body: {}", e));
                return fail(sink, entry, started, Protocol::OpenAI, err);
            }
        };
        let mut request = match CanonicalRequest::from_chat_body(value) {
            Ok(request) => request,
            Err(err) => return fail(sink, entry, started, Protocol::OpenAI, err),
        };

        entry.model = request.model.clone();
        state.prepare_request(&mut request);
        entry.effective_model = request.model.clone();

        tracing::debug!(
            request_id = %request_id,
            model = %entry.model,
            effective_model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "Processing chat completion request"
        );

        if request.stream {
            let first = match state.upstream.open_stream(&request, true).await {
                Ok(first) => first,
                Err(err) => return fail(sink, entry, started, Protocol::OpenAI, err),
            };
            entry.effective_model = first.effective_request.model.clone();
            entry.upstream_status = Some(first.response.status().as_u16());

            let tap = Arc::new(Mutex::new(ChunkAccumulator::new()));
            let source = state.continuation.clone().stream(first, tap.clone());
            let sink = state.sink.clone();
            return sse_response(source, CHAT_COMPLETIONS_PATH, move |outcome| {
                sink.record(finish_stream_entry(entry, started, &tap, outcome));
            });
        }

        match state.continuation.complete(&request).await {
            Ok(completion) => {
                entry.effective_model = completion.effective_request.model.clone();
                finish_completion_entry(&mut entry, started, &completion.body);
                tracing::info!(
                    request_id = %request_id,
                    model = %entry.model,
                    effective_model = %entry.effective_model,
                    latency_ms = entry.latency_ms,
                    "Chat completion finished"
                );
                sink.record(entry);
                Json(completion.body).into_response()
            }
            Err(err) => fail(sink, entry, started, Protocol::OpenAI, err),
        }
    })
}

// ============================================================================
// Catalog, health, metrics
// ============================================================================

fn catalog_entry(id: &str) -> Value {
    json!({
        "id": id,
        "object": "model",
        "created": chrono::Utc::now().timestamp(),
        "owned_by": "iflow",
    })
}

/// Append static catalog entries the upstream list does not already contain.
pub fn merge_catalog(upstream: Option<&Value>) -> Value {
    let mut data: Vec<Value> = upstream
        .and_then(|v| v.get("data"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let listed: HashSet<String> = data
        .iter()
        .filter_map(|m| m.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    data.extend(
        STATIC_MODELS
            .iter()
            .filter(|id| !listed.contains(**id))
            .map(|id| catalog_entry(id)),
    );
    json!({ "object": "list", "data": data })
}

/// List available models.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let request_id = generate_request_id();
    with_request_context!(request_id, "/v1/models".to_string(), async move {
        match state.upstream.list_models().await {
            Ok(upstream) => Json(merge_catalog(Some(&upstream))).into_response(),
            Err(err) => {
                tracing::warn!(
                    request_id = %get_request_id(),
                    error = %err,
                    "Upstream model list unavailable; serving static catalog"
                );
                Json(merge_catalog(None)).into_response()
            }
        }
    })
}

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": SERVICE_NAME }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return AppError::Internal(e.to_string()).into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}
