//! Automatic continuation of length-truncated replies.
//!
//! When the upstream stops with `finish_reason = "length"`, a follow-up
//! request is sent with the text produced so far as a trailing assistant
//! message, and the replies are stitched together. The trailing message is
//! rebuilt on every hop, so the upstream always sees exactly one partial
//! assistant turn after the caller's conversation.

use crate::core::error::{AppError, Result};
use crate::core::logging::get_request_id;
use crate::core::metrics::get_metrics;
use crate::services::upstream_client::{Completion, UpstreamClient, UpstreamStream};
use crate::transformer::stream::{ChunkAccumulator, StreamDelta};
use crate::transformer::{format_sse_data, format_sse_done, sse_events, CanonicalRequest, Message};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

const LENGTH_FINISH: &str = "length";

/// Request for the next hop: the effective request plus one synthetic
/// assistant message holding everything generated so far.
pub fn continuation_request(base: &CanonicalRequest, content: &str, reasoning: &str) -> CanonicalRequest {
    let mut next = base.clone();
    let mut partial = Message::assistant(content);
    if !reasoning.is_empty() {
        partial.reasoning = Some(reasoning.to_string());
    }
    next.messages.push(partial);
    next
}

fn finish_reason(body: &Value) -> Option<&str> {
    body.pointer("/choices/0/finish_reason").and_then(Value::as_str)
}

fn usage_field(usage: Option<&Value>, name: &str) -> u64 {
    usage
        .and_then(|u| u.get(name))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Merge the usage of one more hop: completion tokens add up, the prompt
/// count is the latest hop's, the total is recomputed.
pub fn merge_usage(accumulated: Option<&Value>, next: Option<&Value>) -> Value {
    let prompt = usage_field(next, "prompt_tokens");
    let completion =
        usage_field(accumulated, "completion_tokens") + usage_field(next, "completion_tokens");
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion,
    })
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// Fold one hop's completion into the accumulated one.
pub fn merge_hop(accumulated: &mut Value, next: &Value) {
    let usage = merge_usage(accumulated.get("usage"), next.get("usage"));
    let next_message = next.pointer("/choices/0/message");
    let next_finish = finish_reason(next).map(str::to_string);

    if let Some(message) = accumulated
        .pointer_mut("/choices/0/message")
        .and_then(Value::as_object_mut)
    {
        merge_text_field(message, "content", next_message.and_then(|m| m.get("content")));
        merge_text_field(
            message,
            "reasoning_content",
            next_message.and_then(|m| m.get("reasoning_content")),
        );
        if let Some(Value::Array(calls)) = next_message.and_then(|m| m.get("tool_calls")) {
            let entry = message
                .entry("tool_calls")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(existing) = entry {
                existing.extend(calls.iter().cloned());
            }
        }
    }
    if let Some(choice) = accumulated.pointer_mut("/choices/0").and_then(Value::as_object_mut) {
        choice.insert(
            "finish_reason".into(),
            next_finish.map(Value::String).unwrap_or(Value::Null),
        );
    }
    if let Value::Object(obj) = accumulated {
        obj.insert("usage".into(), usage);
    }
}

fn merge_text_field(message: &mut Map<String, Value>, key: &str, next: Option<&Value>) {
    let addition = text_of(next);
    if addition.is_empty() {
        return;
    }
    let mut merged = text_of(message.get(key));
    merged.push_str(&addition);
    message.insert(key.into(), Value::String(merged));
}

/// Drives continuation hops for both response modes.
pub struct ContinuationController {
    client: Arc<UpstreamClient>,
    max_hops: usize,
}

impl ContinuationController {
    pub fn new(client: Arc<UpstreamClient>, max_hops: usize) -> Self {
        Self { client, max_hops }
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Complete a request, continuing while the reply is cut off by length.
    pub async fn complete(&self, request: &CanonicalRequest) -> Result<Completion> {
        let first = self.client.complete(request).await?;
        let effective = first.effective_request;
        let mut merged = first.body;
        let mut hops = 0;

        while finish_reason(&merged) == Some(LENGTH_FINISH) && hops < self.max_hops {
            hops += 1;
            let content = text_of(merged.pointer("/choices/0/message/content"));
            let reasoning = text_of(merged.pointer("/choices/0/message/reasoning_content"));
            tracing::info!(
                request_id = %get_request_id(),
                hop = hops,
                max_hops = self.max_hops,
                content_chars = content.chars().count(),
                "Reply truncated by length; continuing"
            );
            get_metrics()
                .continuation_hops
                .with_label_values(&["false"])
                .inc();

            let next_request = continuation_request(&effective, &content, &reasoning);
            let next = self.client.complete_direct(&next_request).await?;
            merge_hop(&mut merged, &next);
        }

        Ok(Completion {
            body: merged,
            effective_request: effective,
        })
    }

    /// Forward a chat/completions stream, continuing while it ends by length.
    ///
    /// Every upstream frame except `[DONE]` is forwarded verbatim; a single
    /// `[DONE]` is emitted once the last hop ends. Later hops are opened
    /// without retries, so a failure after bytes were forwarded ends the
    /// stream instead of repeating output.
    pub fn stream(
        self: Arc<Self>,
        first: UpstreamStream,
        tap: Arc<Mutex<ChunkAccumulator>>,
    ) -> impl Stream<Item = std::result::Result<Bytes, AppError>> + Send {
        async_stream::try_stream! {
            let effective = first.effective_request;
            let mut response = first.response;
            let mut content = String::new();
            let mut reasoning = String::new();
            let mut hops = 0;

            loop {
                let mut hop = ChunkAccumulator::new();
                let mut frames = Box::pin(sse_events(response.bytes_stream()));
                while let Some(event) = frames.next().await {
                    let event = event?;
                    let data = match event.data {
                        Some(data) => data,
                        None => continue,
                    };
                    if data.trim() == "[DONE]" {
                        continue;
                    }
                    if let Ok(chunk) = serde_json::from_str::<Value>(&data) {
                        let delta = StreamDelta::from_chunk(&chunk);
                        hop.add(&delta);
                        if let Ok(mut shared) = tap.lock() {
                            shared.add(&delta);
                        }
                    }
                    yield Bytes::from(format_sse_data(&data));
                }

                content.push_str(&hop.content);
                reasoning.push_str(&hop.reasoning);
                if hop.finish_reason.as_deref() != Some(LENGTH_FINISH) || hops >= self.max_hops {
                    break;
                }

                hops += 1;
                tracing::info!(
                    request_id = %get_request_id(),
                    hop = hops,
                    max_hops = self.max_hops,
                    "Stream truncated by length; continuing"
                );
                get_metrics()
                    .continuation_hops
                    .with_label_values(&["true"])
                    .inc();
                let next_request = continuation_request(&effective, &content, &reasoning);
                response = self.client.open_stream_direct(&next_request, false).await?;
            }

            yield Bytes::from(format_sse_done());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn completion(content: &str, finish: &str, prompt: u64, completion: u64) -> Value {
        json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": finish
            }],
            "usage": {"prompt_tokens": prompt, "completion_tokens": completion, "total_tokens": prompt + completion}
        })
    }

    #[test]
    fn test_merge_hop() {
        let mut acc = completion("Hello", "length", 5, 3);
        merge_hop(&mut acc, &completion(" world", "stop", 8, 2));
        assert_eq!(acc["choices"][0]["message"]["content"], json!("Hello world"));
        assert_eq!(acc["choices"][0]["finish_reason"], json!("stop"));
        assert_eq!(
            acc["usage"],
            json!({"prompt_tokens": 8, "completion_tokens": 5, "total_tokens": 13})
        );
        assert_eq!(acc["id"], json!("chatcmpl-1"));
    }

    #[test]
    fn test_merge_reasoning_and_tool_calls() {
        let mut acc = json!({
            "choices": [{"message": {"content": "a", "reasoning_content": "r1"}, "finish_reason": "length"}]
        });
        let next = json!({
            "choices": [{
                "message": {
                    "content": "b",
                    "reasoning_content": "r2",
                    "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{}"}}]
                },
                "finish_reason": "tool_calls"
            }]
        });
        merge_hop(&mut acc, &next);
        let message = &acc["choices"][0]["message"];
        assert_eq!(message["content"], json!("ab"));
        assert_eq!(message["reasoning_content"], json!("r1r2"));
        assert_eq!(message["tool_calls"][0]["id"], json!("call_1"));
        assert_eq!(acc["usage"]["total_tokens"], json!(0));
    }

    #[test]
    fn test_continuation_request_appends_one_partial() {
        let base = CanonicalRequest::new("glm-4.7", vec![Message::user("write")]);
        let next = continuation_request(&base, "partial", "thought");
        assert_eq!(next.messages.len(), 2);
        assert_eq!(next.messages[1].text(), "partial");
        assert_eq!(next.messages[1].reasoning.as_deref(), Some("thought"));

        let again = continuation_request(&base, "partial more", "");
        assert_eq!(again.messages.len(), 2);
        assert_eq!(again.messages[1].reasoning, None);
    }
}
