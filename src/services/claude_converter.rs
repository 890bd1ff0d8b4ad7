//! Messages API conversion.
//!
//! The request side normalizes a Messages body into the canonical model; the
//! response side transcodes a completed chat/completions reply into a
//! Messages response. Streaming replies go through
//! [`crate::transformer::StreamState`] instead.

use crate::api::claude_models::{
    constants, ClaudeContentBlock, ClaudeMessage, ClaudeMessageContent, ClaudeMessagesRequest,
    ClaudeResponse, ClaudeResponseBlock, ClaudeSystemPrompt, ClaudeTool, ClaudeUsage,
};
use crate::core::error::{AppError, Result};
use crate::core::logging::{generate_message_id, generate_tool_use_id};
use crate::services::thinking::budget_to_effort;
use crate::transformer::canonical::clamp_max_tokens;
use crate::transformer::stream::{collect_reasoning_texts, map_finish_reason, StreamUsage};
use crate::transformer::{
    CanonicalRequest, ContentBlock, Message, Role, StopSequences, ToolChoice, ToolSpec,
};
use serde_json::{json, Value};

// ============================================================================
// Request Conversion: Messages -> canonical
// ============================================================================

/// Normalize a Messages request.
///
/// - system text/image blocks become one leading system message
/// - `thinking` blocks on assistant turns become that turn's reasoning
/// - each `tool_result` becomes a tool message placed before the turn that
///   carried it
/// - `redacted_thinking` and unknown blocks are dropped
pub fn claude_to_canonical(request: ClaudeMessagesRequest) -> Result<CanonicalRequest> {
    if request.model.trim().is_empty() {
        return Err(AppError::InvalidRequest("model is required".to_string()));
    }
    let Some(claude_messages) = request.messages else {
        return Err(AppError::InvalidRequest("messages is required".to_string()));
    };

    let messages = convert_messages(request.system.as_ref(), &claude_messages)?;
    if !messages.iter().any(|m| m.role != Role::System) {
        return Err(AppError::InvalidRequest(
            "messages must contain at least one non-system message".to_string(),
        ));
    }

    let mut canonical = CanonicalRequest::new(request.model, messages);
    canonical.max_tokens = clamp_max_tokens(request.max_tokens);
    canonical.stream = request.stream;
    canonical.user = request.user;

    // temperature wins when both are sent
    match (request.temperature, request.top_p) {
        (Some(t), _) => canonical.temperature = Some(t),
        (None, Some(p)) => canonical.top_p = Some(p),
        (None, None) => {}
    }

    canonical.stop = request.stop_sequences.and_then(|mut seqs| match seqs.len() {
        0 => None,
        1 => seqs.pop().map(StopSequences::One),
        _ => Some(StopSequences::Many(seqs)),
    });

    canonical.tools = request
        .tools
        .as_deref()
        .map(convert_tools)
        .filter(|t| !t.is_empty());
    canonical.tool_choice = request.tool_choice.as_ref().and_then(convert_tool_choice);

    if let Some(thinking) = &request.thinking {
        let effort = match thinking.thinking_type.as_str() {
            constants::THINKING_DISABLED => Some("none"),
            constants::THINKING_ENABLED => Some(match thinking.budget_tokens {
                Some(budget) if budget >= 0 => budget_to_effort(budget),
                _ => "auto",
            }),
            other => {
                tracing::debug!(thinking_type = other, "Ignoring unknown thinking type");
                None
            }
        };
        if let Some(effort) = effort {
            canonical
                .extra
                .insert("reasoning_effort".into(), json!(effort));
        }
    }

    Ok(canonical)
}

/// Convert the system prompt and message list into canonical messages.
pub fn convert_messages(
    system: Option<&ClaudeSystemPrompt>,
    claude_messages: &[ClaudeMessage],
) -> Result<Vec<Message>> {
    let mut messages = Vec::with_capacity(claude_messages.len() + 1);

    if let Some(system) = system {
        let content = convert_system(system);
        if !content.is_empty() {
            messages.push(Message::new(Role::System, content));
        }
    }

    for (position, msg) in claude_messages.iter().enumerate() {
        let role = match msg.role.as_str() {
            constants::ROLE_USER => Role::User,
            constants::ROLE_ASSISTANT => Role::Assistant,
            "system" => Role::System,
            other => {
                return Err(AppError::InvalidRequest(format!(
                    "messages[{}] has unsupported role '{}'",
                    position, other
                )))
            }
        };

        let blocks = match &msg.content {
            ClaudeMessageContent::Text(text) => {
                messages.push(Message::new(role, vec![ContentBlock::text(text.clone())]));
                continue;
            }
            ClaudeMessageContent::Blocks(blocks) => blocks,
        };

        let mut content = Vec::new();
        let mut reasoning_parts: Vec<&str> = Vec::new();
        let mut tool_messages = Vec::new();

        for block in blocks {
            match block {
                ClaudeContentBlock::Text { text } => {
                    if !text.trim().is_empty() {
                        content.push(ContentBlock::text(text.clone()));
                    }
                }
                ClaudeContentBlock::Image { source } => match source.to_url() {
                    Some(url) => content.push(ContentBlock::Image { url, detail: None }),
                    None => tracing::warn!(position, "Dropping image block without usable source"),
                },
                ClaudeContentBlock::Thinking { thinking, .. } => {
                    if role == Role::Assistant && !thinking.trim().is_empty() {
                        reasoning_parts.push(thinking);
                    }
                }
                ClaudeContentBlock::ToolUse { id, name, input } => {
                    if role == Role::Assistant {
                        content.push(ContentBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: if input.is_null() { json!({}) } else { input.clone() },
                        });
                    }
                }
                ClaudeContentBlock::ToolResult {
                    tool_use_id,
                    content: result,
                    ..
                } => {
                    tool_messages.push(Message::tool_result(
                        tool_use_id.clone(),
                        parse_tool_result_content(result),
                    ));
                }
                ClaudeContentBlock::RedactedThinking { .. } | ClaudeContentBlock::Unknown => {}
            }
        }

        messages.extend(tool_messages);

        if role == Role::Assistant {
            let mut message = Message::new(role, content);
            if !reasoning_parts.is_empty() {
                message.reasoning = Some(reasoning_parts.join("\n\n"));
            }
            messages.push(message);
        } else if !content.is_empty() {
            messages.push(Message::new(role, content));
        }
    }

    Ok(messages)
}

fn convert_system(system: &ClaudeSystemPrompt) -> Vec<ContentBlock> {
    match system {
        ClaudeSystemPrompt::Text(text) if !text.trim().is_empty() => {
            vec![ContentBlock::text(text.clone())]
        }
        ClaudeSystemPrompt::Text(_) => Vec::new(),
        ClaudeSystemPrompt::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b.block_type.as_str() {
                "text" => b
                    .text
                    .as_ref()
                    .filter(|t| !t.trim().is_empty())
                    .map(|t| ContentBlock::text(t.clone())),
                "image" => b
                    .source
                    .as_ref()
                    .and_then(|s| s.to_url())
                    .map(|url| ContentBlock::Image { url, detail: None }),
                _ => None,
            })
            .collect(),
    }
}

/// Flatten tool result content into a string.
fn parse_tool_result_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("text") => obj
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("text") => obj
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        other => other.to_string(),
    }
}

pub fn convert_tools(tools: &[ClaudeTool]) -> Vec<ToolSpec> {
    tools
        .iter()
        .filter(|tool| !tool.name.trim().is_empty())
        .map(|tool| ToolSpec {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool
                .input_schema
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect()
}

fn convert_tool_choice(tool_choice: &Value) -> Option<ToolChoice> {
    let kind = match tool_choice {
        Value::String(s) => s.as_str(),
        other => other.get("type").and_then(Value::as_str)?,
    };
    match kind {
        constants::TOOL_CHOICE_AUTO => Some(ToolChoice::Auto),
        constants::TOOL_CHOICE_ANY => Some(ToolChoice::Required),
        constants::TOOL_CHOICE_NONE => Some(ToolChoice::None),
        constants::TOOL_CHOICE_TOOL => tool_choice
            .get("name")
            .and_then(Value::as_str)
            .map(|name| ToolChoice::Function(name.to_string())),
        _ => None,
    }
}

// ============================================================================
// Response Conversion: chat/completions -> Messages
// ============================================================================

/// Transcode a completed chat/completions reply.
///
/// `model` is the name the caller asked for; the reply's own `model` field is
/// ignored.
pub fn openai_to_claude_response(response: &Value, model: &str) -> ClaudeResponse {
    let id = response
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_message_id);

    let choice = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    let message = choice.and_then(|c| c.get("message"));
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str);

    let mut content = message.map(build_content_blocks).unwrap_or_default();
    let has_tool_use = content
        .iter()
        .any(|b| matches!(b, ClaudeResponseBlock::ToolUse { .. }));
    if content.is_empty() {
        content.push(ClaudeResponseBlock::text(""));
    }

    let stop_reason = if has_tool_use {
        constants::STOP_TOOL_USE
    } else {
        map_finish_reason(finish_reason)
    };

    ClaudeResponse::new(
        id,
        model,
        content,
        stop_reason,
        extract_usage_data(response.get("usage")),
    )
}

#[derive(Default)]
struct BlockBuffer {
    blocks: Vec<ClaudeResponseBlock>,
    pending_thinking: Vec<String>,
    pending_text: Vec<String>,
}

impl BlockBuffer {
    fn flush_thinking(&mut self) {
        if !self.pending_thinking.is_empty() {
            let thinking = self.pending_thinking.concat();
            self.pending_thinking.clear();
            if !thinking.trim().is_empty() {
                self.blocks.push(ClaudeResponseBlock::Thinking { thinking });
            }
        }
    }

    fn flush_text(&mut self) {
        if !self.pending_text.is_empty() {
            let text = self.pending_text.concat();
            self.pending_text.clear();
            if !text.is_empty() {
                self.blocks.push(ClaudeResponseBlock::Text { text });
            }
        }
    }

    fn push_thinking(&mut self, thinking: String) {
        self.flush_text();
        self.pending_thinking.push(thinking);
    }

    fn push_text(&mut self, text: String) {
        self.flush_thinking();
        self.pending_text.push(text);
    }

    fn flush(&mut self) {
        self.flush_thinking();
        self.flush_text();
    }
}

/// Build Messages content blocks from a chat/completions message.
///
/// Reasoning carried in `reasoning_content` comes first. List-form content is
/// walked in arrival order; tool calls follow.
fn build_content_blocks(message: &Value) -> Vec<ClaudeResponseBlock> {
    let mut buffer = BlockBuffer::default();

    if let Some(reasoning) = message.get("reasoning_content") {
        for text in collect_reasoning_texts(reasoning) {
            buffer.push_thinking(text);
        }
    }

    match message.get("content") {
        Some(Value::String(text)) => buffer.push_text(text.clone()),
        Some(Value::Array(items)) => {
            for item in items {
                let kind = item.get("type").and_then(Value::as_str).unwrap_or_default();
                match kind {
                    "text" | "output_text" => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            buffer.push_text(text.to_string());
                        }
                    }
                    "reasoning" | "thinking" => {
                        let source = item
                            .get("thinking")
                            .or_else(|| item.get("text"))
                            .or_else(|| item.get("content"));
                        for text in source.map(collect_reasoning_texts).unwrap_or_default() {
                            buffer.push_thinking(text);
                        }
                    }
                    "tool_call" | "tool_use" | "function_call" => {
                        buffer.flush();
                        if let Some(block) = tool_block(item) {
                            buffer.blocks.push(block);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    buffer.flush();

    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in tool_calls {
            if let Some(block) = tool_block(call) {
                buffer.blocks.push(block);
            }
        }
    }

    buffer.blocks
}

fn tool_block(call: &Value) -> Option<ClaudeResponseBlock> {
    let function = call.get("function").unwrap_or(call);
    let name = function.get("name").and_then(Value::as_str)?;
    let input = match function.get("arguments").or_else(|| function.get("input")) {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or_else(|_| json!({})),
        Some(Value::Object(obj)) => Value::Object(obj.clone()),
        _ => json!({}),
    };
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_tool_use_id);
    Some(ClaudeResponseBlock::ToolUse {
        id,
        name: name.to_string(),
        input,
    })
}

/// Usage with the cached prefix split out of the input count.
fn extract_usage_data(usage: Option<&Value>) -> ClaudeUsage {
    let usage = usage.and_then(StreamUsage::from_value).unwrap_or_default();
    ClaudeUsage {
        input_tokens: usage.input_tokens(),
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: (usage.cached_tokens > 0).then_some(usage.cached_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(body: Value) -> ClaudeMessagesRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_basic_normalization() {
        let req = claude_to_canonical(parse(json!({
            "model": "glm-4.7",
            "max_tokens": 100,
            "system": "Be brief.",
            "messages": [{"role": "user", "content": "Hello"}],
            "stop_sequences": ["END"],
            "temperature": 0.2,
            "top_p": 0.9
        })))
        .unwrap();

        assert_eq!(req.model, "glm-4.7");
        assert_eq!(req.max_tokens, 1024);
        assert_eq!(req.messages[0], Message::system("Be brief."));
        assert_eq!(req.messages[1], Message::user("Hello"));
        assert_eq!(req.stop, Some(StopSequences::One("END".into())));
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.top_p, None);
    }

    #[test]
    fn test_missing_messages_is_invalid() {
        let err = claude_to_canonical(parse(json!({"model": "glm-4.7"}))).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn test_system_only_is_invalid() {
        let err = claude_to_canonical(parse(json!({
            "model": "glm-4.7",
            "system": "rules",
            "messages": []
        })))
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn test_tool_round_trip_ordering() {
        let req = claude_to_canonical(parse(json!({
            "model": "glm-4.7",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "need tool", "signature": "sig"},
                    {"type": "redacted_thinking", "data": "xxx"},
                    {"type": "text", "text": "Checking."},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [
                        {"type": "text", "text": "sunny"},
                        {"type": "text", "text": "22C"}
                    ]},
                    {"type": "text", "text": "thanks"}
                ]}
            ]
        })))
        .unwrap();

        assert_eq!(req.messages.len(), 4);
        let assistant = &req.messages[1];
        assert_eq!(assistant.reasoning.as_deref(), Some("need tool"));
        assert_eq!(
            assistant.content,
            vec![
                ContentBlock::text("Checking."),
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "get_weather".into(),
                    input: json!({"city": "Paris"})
                }
            ]
        );
        assert_eq!(req.messages[2], Message::tool_result("toolu_1", "sunny\n\n22C"));
        assert_eq!(req.messages[3], Message::user("thanks"));
    }

    #[test]
    fn test_tool_result_only_user_turn_yields_just_tool_message() {
        let req = claude_to_canonical(parse(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "f", "input": {}}]},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]}
            ]
        })))
        .unwrap();
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[2].role, Role::Tool);
    }

    #[test]
    fn test_thinking_param_to_effort() {
        let cases = [
            (json!({"type": "enabled", "budget_tokens": 2000}), "low"),
            (json!({"type": "enabled", "budget_tokens": 10000}), "medium"),
            (json!({"type": "enabled", "budget_tokens": 32000}), "high"),
            (json!({"type": "enabled", "budget_tokens": 0}), "none"),
            (json!({"type": "enabled"}), "auto"),
            (json!({"type": "disabled"}), "none"),
        ];
        for (thinking, effort) in cases {
            let req = claude_to_canonical(parse(json!({
                "model": "glm-4.7",
                "messages": [{"role": "user", "content": "x"}],
                "thinking": thinking
            })))
            .unwrap();
            assert_eq!(req.extra["reasoning_effort"], json!(effort));
        }

        let req = claude_to_canonical(parse(json!({
            "model": "glm-4.7",
            "messages": [{"role": "user", "content": "x"}],
            "thinking": {"type": "adaptive"}
        })))
        .unwrap();
        assert!(!req.extra.contains_key("reasoning_effort"));
    }

    #[test]
    fn test_tools_and_choice() {
        let req = claude_to_canonical(parse(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"name": "f", "description": "d", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "any"}
        })))
        .unwrap();
        let tools = req.tools.unwrap();
        assert_eq!(tools[0].parameters, json!({"type": "object"}));
        assert_eq!(req.tool_choice, Some(ToolChoice::Required));

        assert_eq!(
            convert_tool_choice(&json!({"type": "tool", "name": "f"})),
            Some(ToolChoice::Function("f".into()))
        );
        assert_eq!(convert_tool_choice(&json!({"type": "none"})), Some(ToolChoice::None));
    }

    #[test]
    fn test_image_block_becomes_data_uri() {
        let req = claude_to_canonical(parse(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AA"}}
            ]}]
        })))
        .unwrap();
        assert_eq!(
            req.messages[0].content[0],
            ContentBlock::Image {
                url: "data:image/png;base64,AA".into(),
                detail: None
            }
        );
    }

    #[test]
    fn test_response_text_and_reasoning() {
        let resp = openai_to_claude_response(
            &json!({
                "id": "chatcmpl-1",
                "model": "upstream-name",
                "choices": [{
                    "message": {"role": "assistant", "content": "Hello", "reasoning_content": "think"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2}
            }),
            "glm-4.7",
        );
        assert_eq!(resp.model, "glm-4.7");
        assert_eq!(resp.id, "chatcmpl-1");
        assert_eq!(
            resp.content,
            vec![
                ClaudeResponseBlock::Thinking {
                    thinking: "think".into()
                },
                ClaudeResponseBlock::text("Hello")
            ]
        );
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(resp.usage.input_tokens, 10);
        assert_eq!(resp.usage.output_tokens, 2);
    }

    #[test]
    fn test_response_tool_calls_force_tool_use() {
        let resp = openai_to_claude_response(
            &json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [
                            {"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{\"a\":1}"}},
                            {"type": "function", "function": {"name": "g", "arguments": "not json"}}
                        ]
                    },
                    "finish_reason": "stop"
                }]
            }),
            "m",
        );
        assert!(resp.id.starts_with("msg_"));
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(resp.content.len(), 2);
        match &resp.content[1] {
            ClaudeResponseBlock::ToolUse { id, input, .. } => {
                assert!(id.starts_with("toolu_"));
                assert_eq!(input, &json!({}));
            }
            other => panic!("unexpected block {:?}", other),
        }
        assert_eq!(resp.usage, ClaudeUsage::default());
    }

    #[test]
    fn test_response_list_content_keeps_order() {
        let resp = openai_to_claude_response(
            &json!({
                "choices": [{
                    "message": {"content": [
                        {"type": "reasoning", "text": "r1"},
                        {"type": "text", "text": "a"},
                        {"type": "reasoning", "text": "r2"},
                        {"type": "text", "text": "b"}
                    ]},
                    "finish_reason": "length"
                }]
            }),
            "m",
        );
        assert_eq!(
            resp.content,
            vec![
                ClaudeResponseBlock::Thinking { thinking: "r1".into() },
                ClaudeResponseBlock::text("a"),
                ClaudeResponseBlock::Thinking { thinking: "r2".into() },
                ClaudeResponseBlock::text("b"),
            ]
        );
        assert_eq!(resp.stop_reason.as_deref(), Some("max_tokens"));
    }

    #[test]
    fn test_response_never_empty_and_cached_usage() {
        let resp = openai_to_claude_response(
            &json!({
                "choices": [{"message": {"content": ""}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 50, "completion_tokens": 1, "prompt_tokens_details": {"cached_tokens": 20}}
            }),
            "m",
        );
        assert_eq!(resp.content, vec![ClaudeResponseBlock::text("")]);
        assert_eq!(resp.usage.input_tokens, 30);
        assert_eq!(resp.usage.cache_read_input_tokens, Some(20));
    }
}
