//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use iflow_proxy_rust::{
    api::{build_router, AppState},
    core::{init_metrics, AppConfig, CredentialProvider, RequestLog, StaticCredentialProvider},
    services::{RetryPolicy, UpstreamClient},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::MockServer;

pub const TEST_API_KEY: &str = "test-key";

/// Config pointed at the mock upstream, with the operational prompt off so
/// upstream bodies stay small.
pub fn test_config(server: &MockServer) -> AppConfig {
    let mut config = AppConfig::default();
    config.upstream.base_url = server.uri();
    config.upstream.api_key = Some(TEST_API_KEY.to_string());
    config.upstream.request_timeout_secs = 10;
    config.models.inject_system_prompt = false;
    config
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
    }
}

pub struct TestApp {
    pub router: Router,
    pub log: Arc<RequestLog>,
}

pub fn build_app(config: AppConfig) -> TestApp {
    build_app_with_credentials(config, Arc::new(StaticCredentialProvider::new(TEST_API_KEY)))
}

pub fn build_app_with_credentials(
    config: AppConfig,
    credentials: Arc<dyn CredentialProvider>,
) -> TestApp {
    init_metrics();
    let upstream = Arc::new(
        UpstreamClient::new(reqwest::Client::new(), &config, credentials)
            .with_retry_policy(fast_retry()),
    );
    let log = Arc::new(RequestLog::new(32));
    let state = Arc::new(AppState::new(config, upstream, log.clone()));
    TestApp {
        router: build_router(state),
        log,
    }
}

pub async fn post_raw(router: Router, path: &str, body: impl Into<Body>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("authorization", "Bearer client-secret")
        .body(body.into())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

pub async fn post_json(router: Router, path: &str, body: Value) -> (StatusCode, Value) {
    let (status, bytes) = post_raw(router, path, body.to_string()).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

pub async fn post_text(router: Router, path: &str, body: Value) -> (StatusCode, String) {
    let (status, bytes) = post_raw(router, path, body.to_string()).await;
    (status, String::from_utf8(bytes).unwrap())
}

pub async fn get_json(router: Router, path: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// A non-stream chat/completions reply.
pub fn completion(content: &str, finish_reason: &str, prompt: u64, completion: u64) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "upstream-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    })
}

/// One streaming chunk carrying a content delta and an optional finish.
pub fn text_chunk(text: &str, finish_reason: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": finish_reason}]
    })
}

pub fn reasoning_chunk(text: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"reasoning_content": text}, "finish_reason": null}]
    })
}

pub fn usage_chunk(prompt: u64, completion: u64) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [],
        "usage": {"prompt_tokens": prompt, "completion_tokens": completion, "total_tokens": prompt + completion}
    })
}

/// An upstream SSE body: one `data:` frame per chunk, then `[DONE]`.
pub fn sse_body(chunks: &[Value]) -> String {
    let mut body: String = chunks
        .iter()
        .map(|c| format!("data: {}\n\n", c))
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

/// `data:` payloads of an SSE response, in order.
pub fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

/// `event:` names of an SSE response, in order.
pub fn sse_event_names(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .map(str::to_string)
        .collect()
}
