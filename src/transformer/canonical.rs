//! Canonical request model.
//!
//! Both inbound protocols are normalized into a [`CanonicalRequest`] before any
//! upstream policy runs, and the upstream body is always serialized from it.
//! Fields the gateway does not model are carried in an explicit `extra` bag and
//! merged back on serialization.

use crate::core::error::{AppError, Result};
use serde_json::{json, Map, Value};

/// Minimum `max_tokens` sent upstream.
pub const MIN_MAX_TOKENS: u32 = 1024;
/// `max_tokens` used when the caller does not send one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Keys parsed out of a Protocol-A body; everything else goes to `extra`.
const CHAT_KNOWN_KEYS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "stream",
    "stream_options",
    "tools",
    "tool_choice",
    "stop",
    "user",
];

const MESSAGE_KNOWN_KEYS: &[&str] = &[
    "role",
    "content",
    "name",
    "tool_calls",
    "tool_call_id",
    "reasoning_content",
];

/// Apply the `max(requested or 4096, 1024)` rule.
pub fn clamp_max_tokens(requested: Option<u64>) -> u32 {
    let requested = requested
        .map(|v| v.min(u32::MAX as u64) as u32)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    requested.max(MIN_MAX_TOKENS)
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "system" | "developer" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" | "function" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// An image reference: data URI, remote URL or local path.
    Image {
        url: String,
        detail: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Thinking {
        thinking: String,
    },
    /// A Protocol-A content part the gateway does not interpret, forwarded as-is.
    Raw(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentBlock::Image { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Reasoning text carried by assistant messages.
    pub reasoning: Option<String>,
    pub name: Option<String>,
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            reasoning: None,
            name: None,
            extra: Map::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Role::Tool,
            vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
            }],
        )
    }

    pub fn has_images(&self) -> bool {
        self.content.iter().any(ContentBlock::is_image)
    }

    pub fn image_count(&self) -> usize {
        self.content.iter().filter(|b| b.is_image()).count()
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Serialize into a Protocol-A message object.
    pub fn to_chat_json(&self, preserve_reasoning: bool) -> Value {
        let mut obj = Map::new();
        obj.insert("role".into(), json!(self.role.as_str()));

        match self.role {
            Role::Tool => {
                let (id, content) = self
                    .content
                    .iter()
                    .find_map(|b| match b {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } => Some((tool_use_id.clone(), content.clone())),
                        _ => None,
                    })
                    .unwrap_or_else(|| (String::new(), self.text()));
                obj.insert("tool_call_id".into(), json!(id));
                obj.insert("content".into(), json!(content));
            }
            Role::Assistant => {
                obj.insert("content".into(), content_to_chat(&self.content));
                let tool_calls: Vec<Value> = self
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": arguments_string(input),
                            }
                        })),
                        _ => None,
                    })
                    .collect();
                if !tool_calls.is_empty() {
                    obj.insert("tool_calls".into(), Value::Array(tool_calls));
                }
                if preserve_reasoning {
                    if let Some(reasoning) = self.reasoning.as_ref().filter(|r| !r.is_empty()) {
                        obj.insert("reasoning_content".into(), json!(reasoning));
                    }
                }
            }
            Role::System | Role::User => {
                obj.insert("content".into(), content_to_chat(&self.content));
            }
        }

        if let Some(name) = &self.name {
            obj.insert("name".into(), json!(name));
        }
        for (key, value) in &self.extra {
            obj.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(obj)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    Required,
    None,
    Function(String),
}

impl ToolChoice {
    fn to_chat_json(&self) -> Value {
        match self {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Function(name) => json!({
                "type": "function",
                "function": {"name": name}
            }),
        }
    }

    fn from_chat_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => match s.as_str() {
                "auto" => Some(ToolChoice::Auto),
                "required" | "any" => Some(ToolChoice::Required),
                "none" => Some(ToolChoice::None),
                _ => None,
            },
            Value::Object(obj) => obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .map(|name| ToolChoice::Function(name.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    None,
    Auto,
    Budget,
    Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "minimal" => Some(ThinkingLevel::Minimal),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            "xhigh" => Some(ThinkingLevel::Xhigh),
            _ => None,
        }
    }
}

/// Resolved reasoning configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingConfig {
    pub mode: ThinkingMode,
    /// Token budget; `-1` means auto.
    pub budget: i64,
    pub level: Option<ThinkingLevel>,
}

impl ThinkingConfig {
    pub fn none() -> Self {
        Self {
            mode: ThinkingMode::None,
            budget: 0,
            level: None,
        }
    }

    pub fn auto() -> Self {
        Self {
            mode: ThinkingMode::Auto,
            budget: -1,
            level: None,
        }
    }

    pub fn budget(budget: i64) -> Self {
        Self {
            mode: ThinkingMode::Budget,
            budget,
            level: None,
        }
    }

    pub fn level(level: ThinkingLevel) -> Self {
        Self {
            mode: ThinkingMode::Level,
            budget: 0,
            level: Some(level),
        }
    }

    /// Whether the provider should reason at all.
    pub fn is_enabled(&self) -> bool {
        match self.mode {
            ThinkingMode::None => false,
            ThinkingMode::Auto | ThinkingMode::Level => true,
            ThinkingMode::Budget => self.budget != 0,
        }
    }
}

// ============================================================================
// Canonical request
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stream: bool,
    pub tools: Option<Vec<ToolSpec>>,
    pub tool_choice: Option<ToolChoice>,
    pub thinking: Option<ThinkingConfig>,
    pub stop: Option<StopSequences>,
    pub user: Option<String>,
    pub extra: Map<String, Value>,
}

impl CanonicalRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            top_p: None,
            stream: false,
            tools: None,
            tool_choice: None,
            thinking: None,
            stop: None,
            user: None,
            extra: Map::new(),
        }
    }

    pub fn has_images(&self) -> bool {
        self.messages.iter().any(Message::has_images)
    }

    pub fn image_count(&self) -> usize {
        self.messages.iter().map(Message::image_count).sum()
    }

    /// Parse a Protocol-A chat/completions body.
    pub fn from_chat_body(body: Value) -> Result<Self> {
        let Value::Object(mut obj) = body else {
            return Err(AppError::InvalidRequest(
                "Request body must be a JSON object".to_string(),
            ));
        };

        let model = obj
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| AppError::InvalidRequest("model is required".to_string()))?
            .to_string();

        let raw_messages = match obj.get("messages") {
            Some(Value::Array(items)) if !items.is_empty() => items,
            _ => {
                return Err(AppError::InvalidRequest(
                    "messages must be a non-empty array".to_string(),
                ))
            }
        };
        let messages = raw_messages
            .iter()
            .enumerate()
            .map(|(i, m)| parse_chat_message(m, i))
            .collect::<Result<Vec<_>>>()?;

        let max_tokens = clamp_max_tokens(
            obj.get("max_tokens")
                .or_else(|| obj.get("max_completion_tokens"))
                .and_then(Value::as_u64),
        );

        let tools = obj.get("tools").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|tool| {
                    let function = tool.get("function")?;
                    Some(ToolSpec {
                        name: function.get("name")?.as_str()?.to_string(),
                        description: function
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        parameters: function
                            .get("parameters")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect::<Vec<_>>()
        });

        let stop = match obj.get("stop") {
            Some(Value::String(s)) => Some(StopSequences::One(s.clone())),
            Some(Value::Array(items)) => Some(StopSequences::Many(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            )),
            _ => None,
        };

        let request = CanonicalRequest {
            model,
            messages,
            max_tokens,
            temperature: obj.get("temperature").and_then(Value::as_f64),
            top_p: obj.get("top_p").and_then(Value::as_f64),
            stream: obj.get("stream").and_then(Value::as_bool).unwrap_or(false),
            tools: tools.filter(|t| !t.is_empty()),
            tool_choice: obj.get("tool_choice").and_then(ToolChoice::from_chat_json),
            thinking: None,
            stop,
            user: obj.get("user").and_then(Value::as_str).map(str::to_string),
            extra: Map::new(),
        };

        for key in CHAT_KNOWN_KEYS {
            obj.remove(*key);
        }
        Ok(CanonicalRequest {
            extra: obj,
            ..request
        })
    }

    /// Serialize into a Protocol-A body for the upstream.
    ///
    /// Reasoning text on assistant messages is sent back only when
    /// `preserve_reasoning` is set for the target model family.
    pub fn to_upstream_body(&self, preserve_reasoning: bool) -> Value {
        let mut obj = Map::new();
        obj.insert("model".into(), json!(self.model));
        obj.insert(
            "messages".into(),
            Value::Array(
                self.messages
                    .iter()
                    .map(|m| m.to_chat_json(preserve_reasoning))
                    .collect(),
            ),
        );
        obj.insert("max_tokens".into(), json!(self.max_tokens));
        obj.insert("stream".into(), json!(self.stream));
        if self.stream {
            obj.insert("stream_options".into(), json!({"include_usage": true}));
        }
        if let Some(t) = self.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = self.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(tools) = &self.tools {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    let mut function = Map::new();
                    function.insert("name".into(), json!(t.name));
                    if let Some(d) = &t.description {
                        function.insert("description".into(), json!(d));
                    }
                    function.insert("parameters".into(), t.parameters.clone());
                    json!({"type": "function", "function": function})
                })
                .collect();
            obj.insert("tools".into(), Value::Array(tools));
        }
        if let Some(choice) = &self.tool_choice {
            obj.insert("tool_choice".into(), choice.to_chat_json());
        }
        match &self.stop {
            Some(StopSequences::One(s)) => {
                obj.insert("stop".into(), json!(s));
            }
            Some(StopSequences::Many(list)) => {
                obj.insert("stop".into(), json!(list));
            }
            None => {}
        }
        if let Some(user) = &self.user {
            obj.insert("user".into(), json!(user));
        }
        for (key, value) in &self.extra {
            obj.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(obj)
    }
}

// ============================================================================
// Protocol-A parsing helpers
// ============================================================================

fn parse_chat_message(value: &Value, position: usize) -> Result<Message> {
    let obj = value.as_object().ok_or_else(|| {
        AppError::InvalidRequest(format!("messages[{}] must be an object", position))
    })?;
    let role_name = obj.get("role").and_then(Value::as_str).unwrap_or_default();
    let role = Role::parse(role_name).ok_or_else(|| {
        AppError::InvalidRequest(format!(
            "messages[{}] has unsupported role '{}'",
            position, role_name
        ))
    })?;

    let mut content = match obj.get("content") {
        Some(Value::String(s)) => vec![ContentBlock::text(s.clone())],
        Some(Value::Array(parts)) => parts.iter().map(parse_content_part).collect(),
        _ => Vec::new(),
    };

    if role == Role::Tool {
        let tool_use_id = obj
            .get("tool_call_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let text = content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        content = vec![ContentBlock::ToolResult {
            tool_use_id,
            content: text,
        }];
    }

    if role == Role::Assistant {
        if let Some(calls) = obj.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let function = call.get("function");
                let name = function
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let arguments = function
                    .and_then(|f| f.get("arguments"))
                    .cloned()
                    .unwrap_or(Value::Null);
                content.push(ContentBlock::ToolUse {
                    id: call
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: name.to_string(),
                    input: parse_arguments(arguments),
                });
            }
        }
    }

    let reasoning = if role == Role::Assistant {
        obj.get("reasoning_content")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
    } else {
        None
    };

    let extra = obj
        .iter()
        .filter(|(k, _)| !MESSAGE_KNOWN_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(Message {
        role,
        content,
        reasoning,
        name: obj.get("name").and_then(Value::as_str).map(str::to_string),
        extra,
    })
}

/// Normalize one content part into a block.
///
/// Accepts the chat/completions image shapes (`image_url` as string or
/// object), the responses-style `input_image`/`input_text`, and a
/// Protocol-B style `source` object.
pub fn parse_content_part(part: &Value) -> ContentBlock {
    let kind = part.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "text" | "input_text" => {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                return ContentBlock::text(text);
            }
        }
        "image_url" | "input_image" | "image" => {
            if let Some(block) = image_from_part(part) {
                return block;
            }
        }
        _ => {}
    }
    if part.get("source").is_some() {
        if let Some(block) = image_from_part(part) {
            return block;
        }
    }
    ContentBlock::Raw(part.clone())
}

fn image_from_part(part: &Value) -> Option<ContentBlock> {
    let detail = part
        .get("detail")
        .or_else(|| part.get("image_url").and_then(|u| u.get("detail")))
        .and_then(Value::as_str)
        .map(str::to_string);

    let url = match part.get("image_url") {
        Some(Value::String(url)) => Some(url.clone()),
        Some(Value::Object(obj)) => obj.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
    .or_else(|| part.get("url").and_then(Value::as_str).map(str::to_string))
    .or_else(|| part.get("source").and_then(image_source_url))?;

    Some(ContentBlock::Image { url, detail })
}

/// Turn a Protocol-B image `source` into a URL or data URI.
pub fn image_source_url(source: &Value) -> Option<String> {
    match source.get("type").and_then(Value::as_str) {
        Some("base64") => {
            let media_type = source
                .get("media_type")
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            let data = source.get("data").and_then(Value::as_str)?;
            Some(format!("data:{};base64,{}", media_type, data))
        }
        Some("url") | None => source
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string),
        Some(_) => None,
    }
}

/// Tool-call arguments arrive as a JSON string; keep the raw string if it does
/// not parse so nothing is lost on the way back out.
fn parse_arguments(arguments: Value) -> Value {
    match arguments {
        Value::String(raw) => {
            if raw.trim().is_empty() {
                return json!({});
            }
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        }
        Value::Null => json!({}),
        other => other,
    }
}

fn arguments_string(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn content_to_chat(blocks: &[ContentBlock]) -> Value {
    let parts: Vec<&ContentBlock> = blocks
        .iter()
        .filter(|b| {
            matches!(
                b,
                ContentBlock::Text { .. } | ContentBlock::Image { .. } | ContentBlock::Raw(_)
            )
        })
        .collect();

    match parts.as_slice() {
        [] => json!(""),
        [ContentBlock::Text { text }] => json!(text),
        _ => Value::Array(
            parts
                .into_iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
                    ContentBlock::Image { url, detail } => {
                        let mut image_url = Map::new();
                        image_url.insert("url".into(), json!(url));
                        if let Some(d) = detail {
                            image_url.insert("detail".into(), json!(d));
                        }
                        Some(json!({"type": "image_url", "image_url": image_url}))
                    }
                    ContentBlock::Raw(v) => Some(v.clone()),
                    _ => None,
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_max_tokens_floor() {
        assert_eq!(clamp_max_tokens(None), 4096);
        assert_eq!(clamp_max_tokens(Some(100)), 1024);
        assert_eq!(clamp_max_tokens(Some(8192)), 8192);
    }

    #[test]
    fn test_from_chat_body_requires_model_and_messages() {
        let err = CanonicalRequest::from_chat_body(json!({"messages": []})).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));

        let err = CanonicalRequest::from_chat_body(json!({"model": "glm-4.7", "messages": []}))
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));

        let err = CanonicalRequest::from_chat_body(json!("nope")).unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn test_unknown_fields_round_trip_through_extra() {
        let req = CanonicalRequest::from_chat_body(json!({
            "model": "glm-4.7",
            "messages": [{"role": "user", "content": "hi"}],
            "chat_template_kwargs": {"enable_thinking": true},
            "seed": 7
        }))
        .unwrap();
        assert_eq!(req.extra["seed"], json!(7));

        let body = req.to_upstream_body(false);
        assert_eq!(body["seed"], json!(7));
        assert_eq!(body["chat_template_kwargs"]["enable_thinking"], json!(true));
        assert_eq!(body["messages"][0]["content"], json!("hi"));
        assert_eq!(body["max_tokens"], json!(4096));
    }

    #[test]
    fn test_stream_adds_include_usage() {
        let req = CanonicalRequest::from_chat_body(json!({
            "model": "glm-4.7",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "stream_options": {"include_usage": false}
        }))
        .unwrap();
        let body = req.to_upstream_body(false);
        assert_eq!(body["stream_options"], json!({"include_usage": true}));
    }

    #[test]
    fn test_image_shapes_normalize() {
        let string_form = parse_content_part(&json!({"type": "image_url", "image_url": "https://x/a.png"}));
        assert_eq!(
            string_form,
            ContentBlock::Image {
                url: "https://x/a.png".into(),
                detail: None
            }
        );

        let object_form = parse_content_part(&json!({
            "type": "image_url",
            "image_url": {"url": "https://x/b.png", "detail": "high"}
        }));
        assert_eq!(
            object_form,
            ContentBlock::Image {
                url: "https://x/b.png".into(),
                detail: Some("high".into())
            }
        );

        let input_image =
            parse_content_part(&json!({"type": "input_image", "image_url": "data:image/png;base64,AA"}));
        assert!(input_image.is_image());

        let source_form = parse_content_part(&json!({
            "type": "image",
            "source": {"type": "base64", "media_type": "image/jpeg", "data": "QUJD"}
        }));
        assert_eq!(
            source_form,
            ContentBlock::Image {
                url: "data:image/jpeg;base64,QUJD".into(),
                detail: None
            }
        );

        let audio = json!({"type": "input_audio", "input_audio": {"data": "x"}});
        assert_eq!(parse_content_part(&audio), ContentBlock::Raw(audio.clone()));
    }

    #[test]
    fn test_assistant_tool_calls_and_reasoning() {
        let req = CanonicalRequest::from_chat_body(json!({
            "model": "glm-4.7",
            "messages": [
                {"role": "user", "content": "weather?"},
                {
                    "role": "assistant",
                    "content": null,
                    "reasoning_content": "need a tool",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                    }]
                },
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ]
        }))
        .unwrap();

        let assistant = &req.messages[1];
        assert_eq!(assistant.reasoning.as_deref(), Some("need a tool"));
        assert_eq!(
            assistant.content,
            vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "get_weather".into(),
                input: json!({"city": "Paris"})
            }]
        );

        let body = req.to_upstream_body(false);
        let out = &body["messages"][1];
        assert_eq!(out["content"], json!(""));
        assert_eq!(
            out["tool_calls"][0]["function"]["arguments"],
            json!("{\"city\":\"Paris\"}")
        );
        assert!(out.get("reasoning_content").is_none());
        assert_eq!(body["messages"][2]["tool_call_id"], json!("call_1"));
        assert_eq!(body["messages"][2]["content"], json!("sunny"));

        let preserved = req.to_upstream_body(true);
        assert_eq!(
            preserved["messages"][1]["reasoning_content"],
            json!("need a tool")
        );
    }

    #[test]
    fn test_tool_choice_and_stop() {
        let req = CanonicalRequest::from_chat_body(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tool_choice": {"type": "function", "function": {"name": "f"}},
            "stop": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(req.tool_choice, Some(ToolChoice::Function("f".into())));
        assert_eq!(
            req.stop,
            Some(StopSequences::Many(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_invalid_arguments_are_kept_raw() {
        assert_eq!(parse_arguments(json!("{broken")), json!("{broken"));
        assert_eq!(arguments_string(&json!("{broken")), "{broken");
        assert_eq!(parse_arguments(json!("")), json!({}));
    }

    #[test]
    fn test_multi_part_content_serializes_as_list() {
        let msg = Message::new(
            Role::User,
            vec![
                ContentBlock::text("look"),
                ContentBlock::Image {
                    url: "https://x/a.png".into(),
                    detail: Some("low".into()),
                },
            ],
        );
        let out = msg.to_chat_json(false);
        assert_eq!(out["content"][0], json!({"type": "text", "text": "look"}));
        assert_eq!(
            out["content"][1],
            json!({"type": "image_url", "image_url": {"url": "https://x/a.png", "detail": "low"}})
        );
    }

    #[test]
    fn test_thinking_config_enabled() {
        assert!(!ThinkingConfig::none().is_enabled());
        assert!(ThinkingConfig::auto().is_enabled());
        assert!(!ThinkingConfig::budget(0).is_enabled());
        assert!(ThinkingConfig::budget(2048).is_enabled());
        assert!(ThinkingConfig::level(ThinkingLevel::Minimal).is_enabled());
    }
}
