//! Messages endpoints against a mocked chat/completions upstream.

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::{json, Value};
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn messages_request(stream: bool) -> Value {
    json!({
        "model": "glm-4.7",
        "max_tokens": 512,
        "stream": stream,
        "system": "You are terse.",
        "messages": [{"role": "user", "content": "Say hello"}]
    })
}

#[tokio::test]
async fn test_non_stream_text_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "glm-4.7", "max_tokens": 1024, "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hello", "stop", 12, 1)))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(test_config(&server));
    let (status, body) = post_json(app.router, "/v1/messages", messages_request(false)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["model"], "glm-4.7");
    assert_eq!(body["content"], json!([{"type": "text", "text": "Hello"}]));
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 12);
    assert_eq!(body["usage"]["output_tokens"], 1);
}

#[tokio::test]
async fn test_non_stream_reasoning_and_tool_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-tools",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "reasoning_content": "need the file",
                    "content": "Reading it.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"a.rs\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 40,
                "completion_tokens": 9,
                "total_tokens": 49,
                "prompt_tokens_details": {"cached_tokens": 30}
            }
        })))
        .mount(&server)
        .await;

    let app = build_app(test_config(&server));
    let mut request = messages_request(false);
    request["tools"] = json!([{
        "name": "read_file",
        "description": "Read a file",
        "input_schema": {"type": "object", "properties": {"path": {"type": "string"}}}
    }]);
    let (status, body) = post_json(app.router, "/v1/messages", request).await;

    assert_eq!(status, StatusCode::OK);
    let content = body["content"].as_array().unwrap();
    assert_eq!(content[0]["type"], "thinking");
    assert_eq!(content[0]["thinking"], "need the file");
    assert_eq!(content[1], json!({"type": "text", "text": "Reading it."}));
    assert_eq!(content[2]["type"], "tool_use");
    assert_eq!(content[2]["name"], "read_file");
    assert_eq!(content[2]["input"], json!({"path": "a.rs"}));
    assert_eq!(body["stop_reason"], "tool_use");
    assert_eq!(body["usage"]["input_tokens"], 10);
    assert_eq!(body["usage"]["cache_read_input_tokens"], 30);
}

#[tokio::test]
async fn test_non_stream_is_continued_before_transcoding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hello", "length", 10, 5)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(" world", "stop", 15, 3)))
        .mount(&server)
        .await;

    let app = build_app(test_config(&server));
    let (status, body) = post_json(app.router, "/v1/messages", messages_request(false)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], "Hello world");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["output_tokens"], 8);
}

#[tokio::test]
async fn test_stream_event_order() {
    let server = MockServer::start().await;
    let upstream = sse_body(&[
        reasoning_chunk("thinking..."),
        text_chunk("Hel", None),
        text_chunk("lo", Some("stop")),
        usage_chunk(7, 2),
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(upstream, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(test_config(&server));
    let (status, body) = post_text(app.router, "/v1/messages", messages_request(true)).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        sse_event_names(&body),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let events: Vec<Value> = sse_data(&body)
        .iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert_eq!(events[0]["message"]["model"], "glm-4.7");
    assert_eq!(events[1]["content_block"]["type"], "thinking");
    assert_eq!(events[4]["index"], 1);
    assert_eq!(events[8]["delta"]["stop_reason"], "end_turn");
    assert_eq!(events[8]["usage"]["output_tokens"], 2);
    assert!(!body.contains("[DONE]"));
}

#[tokio::test]
async fn test_stream_tool_arguments_flushed_once() {
    let server = MockServer::start().await;
    let tool_start = json!({
        "choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "id": "call_9", "type": "function",
            "function": {"name": "run", "arguments": "{\"a\":"}
        }]}, "finish_reason": null}]
    });
    let tool_rest = json!({
        "choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": 0, "function": {"arguments": "1}"}
        }]}, "finish_reason": "tool_calls"}]
    });
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&[tool_start, tool_rest]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let app = build_app(test_config(&server));
    let (_, body) = post_text(app.router, "/v1/messages", messages_request(true)).await;

    let events: Vec<Value> = sse_data(&body)
        .iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    let json_deltas: Vec<&Value> = events
        .iter()
        .filter(|e| e["delta"]["type"] == "input_json_delta")
        .collect();
    assert_eq!(json_deltas.len(), 1);
    assert_eq!(json_deltas[0]["delta"]["partial_json"], "{\"a\":1}");

    let stop = events.iter().find(|e| e["type"] == "message_delta").unwrap();
    assert_eq!(stop["delta"]["stop_reason"], "tool_use");
    assert_eq!(events.last().unwrap()["type"], "message_stop");
}

#[tokio::test]
async fn test_stream_without_sentinel_still_stops() {
    let server = MockServer::start().await;
    let upstream = format!("data: {}\n\n", text_chunk("cut", None));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(upstream, "text/event-stream"))
        .mount(&server)
        .await;

    let app = build_app(test_config(&server));
    let (_, body) = post_text(app.router, "/v1/messages", messages_request(true)).await;
    let names = sse_event_names(&body);
    assert_eq!(names.first().map(String::as_str), Some("message_start"));
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));
    assert_eq!(names.iter().filter(|n| *n == "message_stop").count(), 1);
}

#[tokio::test]
async fn test_count_tokens() {
    let server = MockServer::start().await;
    let app = build_app(test_config(&server));
    let (status, body) = post_json(
        app.router,
        "/v1/messages/count_tokens",
        json!({
            "model": "glm-4.7",
            "system": "You are terse.",
            "messages": [{"role": "user", "content": "How many tokens is this?"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["input_tokens"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_malformed_json_uses_messages_envelope() {
    let server = MockServer::start().await;
    let app = build_app(test_config(&server));
    let (status, bytes) = post_raw(app.router, "/v1/messages", "not json").await;
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_missing_messages_is_invalid() {
    let server = MockServer::start().await;
    let app = build_app(test_config(&server));
    let (status, body) = post_json(
        app.router,
        "/v1/messages",
        json!({"model": "glm-4.7", "max_tokens": 10}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "error");
}

#[tokio::test]
async fn test_upstream_failure_uses_messages_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let app = build_app(test_config(&server));
    let (status, body) = post_json(app.router, "/v1/messages", messages_request(false)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "upstream_error");
}

#[tokio::test]
async fn test_over_budget_messages_keep_system_and_latest_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("done", "stop", 5, 1)))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.budgets.context_token_budget = 100;
    let app = build_app(config);
    let (status, _) = post_json(
        app.router,
        "/v1/messages",
        json!({
            "model": "glm-4.7",
            "max_tokens": 256,
            "system": "You are terse.",
            "messages": [
                {"role": "user", "content": "word ".repeat(400)},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "latest"}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[0]["content"], "You are terse.");
    assert_eq!(messages[1]["content"], "ok");
    assert_eq!(messages[2]["content"], "latest");
}
