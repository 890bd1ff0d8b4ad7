//! Incremental Protocol-A chunk to Protocol-B event transcoder.
//!
//! [`StreamState`] is a pure state machine: it consumes decoded upstream chunks
//! (or the end-of-stream marker) and returns the Protocol-B events to emit. It
//! performs no I/O, so it is driven the same way by the HTTP pipeline, the
//! tests and the benchmarks.
//!
//! Guarantees on the output sequence:
//! - exactly one `message_start`, always first
//! - at most one `message_stop`, always last
//! - block indices increase from zero and are never reused
//! - every block start is matched by exactly one stop

use crate::api::claude_models::constants;
use serde_json::{json, Value};
use std::collections::BTreeMap;

// ============================================================================
// Decoded upstream chunk
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: i64,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
}

impl StreamUsage {
    pub fn from_value(usage: &Value) -> Option<Self> {
        if !usage.is_object() {
            return None;
        }
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
        Some(Self {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            cached_tokens: usage
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }

    /// Protocol-B input tokens exclude the cached prefix.
    pub fn input_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_sub(self.cached_tokens)
    }
}

/// The parts of one Protocol-A chunk the transcoder cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    pub reasoning: Vec<String>,
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
    pub usage: Option<StreamUsage>,
}

impl StreamDelta {
    /// Decode a chunk. Usage is read even when `choices` is empty.
    pub fn from_chunk(chunk: &Value) -> Self {
        let mut delta = StreamDelta {
            usage: chunk.get("usage").and_then(StreamUsage::from_value),
            ..Default::default()
        };

        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return delta;
        };

        delta.finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(d) = choice.get("delta") else {
            return delta;
        };

        if let Some(reasoning) = d.get("reasoning_content") {
            delta.reasoning = collect_reasoning_texts(reasoning);
        }

        delta.text = match d.get("content") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Array(parts)) => {
                let joined: String = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect();
                (!joined.is_empty()).then_some(joined)
            }
            _ => None,
        };

        if let Some(calls) = d.get("tool_calls").and_then(Value::as_array) {
            delta.tool_calls = calls
                .iter()
                .enumerate()
                .map(|(pos, call)| {
                    let function = call.get("function");
                    ToolCallDelta {
                        index: call
                            .get("index")
                            .and_then(Value::as_i64)
                            .unwrap_or(pos as i64),
                        id: call
                            .get("id")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                        name: function
                            .and_then(|f| f.get("name"))
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                        arguments: function
                            .and_then(|f| f.get("arguments"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    }
                })
                .collect();
        }

        delta
    }
}

/// Reasoning may arrive as a string, `{text}` or a list of either.
pub fn collect_reasoning_texts(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(collect_reasoning_texts).collect(),
        Value::Object(obj) => obj
            .get("text")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Map a Protocol-A finish reason to a Protocol-B stop reason.
pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => constants::STOP_MAX_TOKENS,
        Some("tool_calls") | Some("function_call") => constants::STOP_TOOL_USE,
        _ => constants::STOP_END_TURN,
    }
}

// ============================================================================
// Protocol-B events
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart { id: String, model: String },
    BlockStart { index: usize, kind: BlockKind },
    TextDelta { index: usize, text: String },
    ThinkingDelta { index: usize, thinking: String },
    InputJsonDelta { index: usize, partial_json: String },
    BlockStop { index: usize },
    MessageDelta {
        stop_reason: &'static str,
        usage: Option<StreamUsage>,
    },
    MessageStop,
}

impl StreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::BlockStart { .. } => "content_block_start",
            StreamEvent::TextDelta { .. }
            | StreamEvent::ThinkingDelta { .. }
            | StreamEvent::InputJsonDelta { .. } => "content_block_delta",
            StreamEvent::BlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StreamEvent::MessageStart { id, model } => json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
            StreamEvent::BlockStart { index, kind } => {
                let block = match kind {
                    BlockKind::Text => json!({"type": "text", "text": ""}),
                    BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
                    BlockKind::ToolUse { id, name } => json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": {}
                    }),
                };
                json!({"type": "content_block_start", "index": index, "content_block": block})
            }
            StreamEvent::TextDelta { index, text } => json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text}
            }),
            StreamEvent::ThinkingDelta { index, thinking } => json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "thinking_delta", "thinking": thinking}
            }),
            StreamEvent::InputJsonDelta {
                index,
                partial_json,
            } => json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "input_json_delta", "partial_json": partial_json}
            }),
            StreamEvent::BlockStop { index } => {
                json!({"type": "content_block_stop", "index": index})
            }
            StreamEvent::MessageDelta { stop_reason, usage } => {
                let mut event = json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason, "stop_sequence": null}
                });
                if let Some(u) = usage {
                    let mut usage_obj = json!({
                        "input_tokens": u.input_tokens(),
                        "output_tokens": u.completion_tokens,
                    });
                    if u.cached_tokens > 0 {
                        usage_obj["cache_read_input_tokens"] = json!(u.cached_tokens);
                    }
                    event["usage"] = usage_obj;
                }
                event
            }
            StreamEvent::MessageStop => json!({"type": "message_stop"}),
        }
    }

    /// Wire form: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        super::sse::format_sse_event(self.event_name(), &self.to_json().to_string())
    }
}

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum StreamInput {
    Chunk(StreamDelta),
    Done,
}

#[derive(Debug, Clone)]
struct OpenTool {
    index: usize,
    args: String,
}

/// Per-stream transcoder state. One instance per stream, driven sequentially.
#[derive(Debug, Clone)]
pub struct StreamState {
    message_id: String,
    model: String,
    next_block_index: usize,
    open_thinking_index: Option<usize>,
    open_text_index: Option<usize>,
    /// Open tool blocks keyed by the upstream call slot.
    tool_blocks: BTreeMap<i64, OpenTool>,
    finish_reason: Option<String>,
    usage: Option<StreamUsage>,
    message_started: bool,
    blocks_stopped: bool,
    delta_sent: bool,
    stop_sent: bool,
}

impl StreamState {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            next_block_index: 0,
            open_thinking_index: None,
            open_text_index: None,
            tool_blocks: BTreeMap::new(),
            finish_reason: None,
            usage: None,
            message_started: false,
            blocks_stopped: false,
            delta_sent: false,
            stop_sent: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stop_sent
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn usage(&self) -> Option<StreamUsage> {
        self.usage
    }

    /// Advance the machine by one input. After `message_stop` every input is
    /// a no-op.
    pub fn step(&mut self, input: StreamInput) -> Vec<StreamEvent> {
        if self.stop_sent {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        match input {
            StreamInput::Chunk(delta) => self.on_chunk(delta, &mut out),
            StreamInput::Done => self.on_done(&mut out),
        }
        out
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.message_started {
            self.message_started = true;
            out.push(StreamEvent::MessageStart {
                id: self.message_id.clone(),
                model: self.model.clone(),
            });
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    fn close_thinking(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(index) = self.open_thinking_index.take() {
            out.push(StreamEvent::BlockStop { index });
        }
    }

    fn close_text(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(index) = self.open_text_index.take() {
            out.push(StreamEvent::BlockStop { index });
        }
    }

    fn close_tool(&mut self, slot: i64, out: &mut Vec<StreamEvent>) {
        if let Some(tool) = self.tool_blocks.remove(&slot) {
            if !tool.args.is_empty() {
                out.push(StreamEvent::InputJsonDelta {
                    index: tool.index,
                    partial_json: tool.args,
                });
            }
            out.push(StreamEvent::BlockStop { index: tool.index });
        }
    }

    fn close_all(&mut self, out: &mut Vec<StreamEvent>) {
        self.close_thinking(out);
        self.close_text(out);
        let slots: Vec<i64> = self.tool_blocks.keys().copied().collect();
        for slot in slots {
            self.close_tool(slot, out);
        }
        self.blocks_stopped = true;
    }

    fn on_chunk(&mut self, delta: StreamDelta, out: &mut Vec<StreamEvent>) {
        for thinking in delta.reasoning.into_iter().filter(|t| !t.is_empty()) {
            self.close_text(out);
            let index = match self.open_thinking_index {
                Some(index) => index,
                None => {
                    let index = self.allocate_index();
                    self.open_thinking_index = Some(index);
                    out.push(StreamEvent::BlockStart {
                        index,
                        kind: BlockKind::Thinking,
                    });
                    index
                }
            };
            out.push(StreamEvent::ThinkingDelta { index, thinking });
        }

        if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
            self.close_thinking(out);
            let index = match self.open_text_index {
                Some(index) => index,
                None => {
                    let index = self.allocate_index();
                    self.open_text_index = Some(index);
                    out.push(StreamEvent::BlockStart {
                        index,
                        kind: BlockKind::Text,
                    });
                    index
                }
            };
            out.push(StreamEvent::TextDelta { index, text });
        }

        for call in delta.tool_calls {
            self.on_tool_delta(call, out);
        }

        if let Some(reason) = delta.finish_reason {
            self.finish_reason = Some(reason);
            self.close_all(out);
        }

        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
            if self.finish_reason.is_some() && !self.delta_sent {
                self.close_all(out);
                self.emit_message_delta(out);
                self.emit_stop(out);
            }
        }
    }

    fn on_tool_delta(&mut self, call: ToolCallDelta, out: &mut Vec<StreamEvent>) {
        let slot = call.index;
        let open = self.tool_blocks.contains_key(&slot);
        // A fresh id on an open slot starts a new call; a name without an id
        // only opens a slot that is not already open.
        let starts_new = call.id.is_some() || (!open && call.name.is_some());

        if starts_new {
            self.close_thinking(out);
            self.close_text(out);
            if open {
                self.close_tool(slot, out);
            }
            let index = self.allocate_index();
            let id = call
                .id
                .clone()
                .unwrap_or_else(crate::core::logging::generate_tool_use_id);
            out.push(StreamEvent::BlockStart {
                index,
                kind: BlockKind::ToolUse {
                    id,
                    name: call.name.clone().unwrap_or_default(),
                },
            });
            self.tool_blocks.insert(
                slot,
                OpenTool {
                    index,
                    args: String::new(),
                },
            );
        }

        if let Some(args) = call.arguments.filter(|a| !a.is_empty()) {
            match self.tool_blocks.get_mut(&slot) {
                Some(tool) => tool.args.push_str(&args),
                None => tracing::debug!(slot, "Dropping tool arguments for unopened call"),
            }
        }
    }

    fn emit_message_delta(&mut self, out: &mut Vec<StreamEvent>) {
        self.delta_sent = true;
        out.push(StreamEvent::MessageDelta {
            stop_reason: map_finish_reason(self.finish_reason.as_deref()),
            usage: self.usage,
        });
    }

    fn emit_stop(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.stop_sent {
            self.stop_sent = true;
            out.push(StreamEvent::MessageStop);
        }
    }

    fn on_done(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.blocks_stopped || self.has_open_blocks() {
            self.close_all(out);
        }
        if self.finish_reason.is_some() && !self.delta_sent {
            self.emit_message_delta(out);
        }
        self.emit_stop(out);
    }

    fn has_open_blocks(&self) -> bool {
        self.open_text_index.is_some()
            || self.open_thinking_index.is_some()
            || !self.tool_blocks.is_empty()
    }
}

// ============================================================================
// Protocol-A passthrough bookkeeping
// ============================================================================

/// Accumulates what a forwarded Protocol-A stream said, for logging and
/// continuation decisions.
#[derive(Debug, Clone, Default)]
pub struct ChunkAccumulator {
    pub content: String,
    pub reasoning: String,
    pub finish_reason: Option<String>,
    pub usage: Option<StreamUsage>,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, delta: &StreamDelta) {
        for r in &delta.reasoning {
            self.reasoning.push_str(r);
        }
        if let Some(text) = &delta.text {
            self.content.push_str(text);
        }
        if let Some(reason) = &delta.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
    }
}
