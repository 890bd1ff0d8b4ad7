//! Messages API endpoints.
//!
//! Requests are normalized into the canonical model, sent through the same
//! upstream client as chat/completions, and replies are transcoded back. A
//! streamed reply is transcoded event by event with
//! [`crate::transformer::StreamState`]; a non-stream reply is continued past
//! length truncation first and transcoded once.

use crate::api::claude_models::{ClaudeMessagesRequest, ClaudeTokenCountRequest, ClaudeTokenCountResponse};
use crate::api::handlers::{begin_entry, fail, finish_completion_entry, finish_stream_entry, AppState};
use crate::api::streaming::{sse_response, transcode_stream};
use crate::core::error::{AppError, Result};
use crate::core::logging::{generate_message_id, generate_request_id};
use crate::services::claude_converter::{
    claude_to_canonical, convert_messages, convert_tools, openai_to_claude_response,
};
use crate::services::compressor::estimate_request_tokens;
use crate::transformer::{CanonicalRequest, ChunkAccumulator, Protocol};
use crate::with_request_context;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub const MESSAGES_PATH: &str = "/v1/messages";
pub const COUNT_TOKENS_PATH: &str = "/v1/messages/count_tokens";

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid JSON body: {}", e)))
}

/// Handle Messages requests.
///
/// Replies carry the model name the caller sent, suffix included.
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = generate_request_id();

    with_request_context!(request_id.clone(), MESSAGES_PATH.to_string(), async move {
        let started = Instant::now();
        let mut entry = begin_entry(MESSAGES_PATH, &request_id, &headers, &body);
        let sink = state.sink.as_ref();

        let claude_request: ClaudeMessagesRequest = match parse_body(&body) {
            Ok(request) => request,
            Err(err) => return fail(sink, entry, started, Protocol::Anthropic, err),
        };
        let client_model = claude_request.model.clone();
        entry.model = client_model.clone();

        let mut request = match claude_to_canonical(claude_request) {
            Ok(request) => request,
            Err(err) => return fail(sink, entry, started, Protocol::Anthropic, err),
        };
        state.prepare_request(&mut request);
        entry.effective_model = request.model.clone();

        tracing::debug!(
            request_id = %request_id,
            model = %client_model,
            effective_model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "Processing Messages request"
        );

        if request.stream {
            let upstream = match state.upstream.open_stream(&request, true).await {
                Ok(upstream) => upstream,
                Err(err) => return fail(sink, entry, started, Protocol::Anthropic, err),
            };
            entry.effective_model = upstream.effective_request.model.clone();
            entry.upstream_status = Some(upstream.response.status().as_u16());

            let tap = Arc::new(Mutex::new(ChunkAccumulator::new()));
            let source = transcode_stream(upstream, generate_message_id(), client_model, tap.clone());
            let sink = state.sink.clone();
            return sse_response(source, MESSAGES_PATH, move |outcome| {
                sink.record(finish_stream_entry(entry, started, &tap, outcome));
            });
        }

        match state.continuation.complete(&request).await {
            Ok(completion) => {
                entry.effective_model = completion.effective_request.model.clone();
                finish_completion_entry(&mut entry, started, &completion.body);
                let response = openai_to_claude_response(&completion.body, &client_model);
                tracing::info!(
                    request_id = %request_id,
                    model = %client_model,
                    effective_model = %entry.effective_model,
                    stop_reason = ?response.stop_reason,
                    latency_ms = entry.latency_ms,
                    "Messages request finished"
                );
                sink.record(entry);
                Json(response).into_response()
            }
            Err(err) => fail(sink, entry, started, Protocol::Anthropic, err),
        }
    })
}

/// Estimate input tokens for a Messages request without calling upstream.
pub async fn count_tokens(body: Bytes) -> Response {
    let request_id = generate_request_id();

    with_request_context!(request_id, COUNT_TOKENS_PATH.to_string(), async move {
        match estimate_input_tokens(&body) {
            Ok(input_tokens) => Json(ClaudeTokenCountResponse { input_tokens }).into_response(),
            Err(err) => err.into_protocol_response(Protocol::Anthropic),
        }
    })
}

fn estimate_input_tokens(body: &Bytes) -> Result<u64> {
    let request: ClaudeTokenCountRequest = parse_body(body)?;
    let messages = convert_messages(request.system.as_ref(), &request.messages)?;
    let mut canonical = CanonicalRequest::new(request.model, messages);
    canonical.tools = request.tools.as_deref().map(convert_tools);
    Ok(estimate_request_tokens(&canonical) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_counts_system_and_tools() {
        let bare = Bytes::from(r#"{"model":"glm-4.7","messages":[{"role":"user","content":"hello there"}]}"#);
        let rich = Bytes::from(
            r#"{"model":"glm-4.7","system":"You are terse.","messages":[{"role":"user","content":"hello there"}],
                "tools":[{"name":"read_file","description":"Read a file","input_schema":{"type":"object"}}]}"#,
        );
        let bare_tokens = estimate_input_tokens(&bare).unwrap();
        let rich_tokens = estimate_input_tokens(&rich).unwrap();
        assert!(bare_tokens >= 1);
        assert!(rich_tokens > bare_tokens);
    }

    #[test]
    fn test_estimate_never_zero() {
        let empty = Bytes::from(r#"{"model":"glm-4.7","messages":[]}"#);
        assert_eq!(estimate_input_tokens(&empty).unwrap(), 1);
    }

    #[test]
    fn test_estimate_rejects_malformed_json() {
        let err = estimate_input_tokens(&Bytes::from("{not json")).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }
}
