//! Messages API request and response models.
//!
//! Inbound content blocks are parsed with an internally tagged enum so an
//! unknown block type is skipped instead of failing the whole request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Constants
// ============================================================================

pub mod constants {
    pub const ROLE_USER: &str = "user";
    pub const ROLE_ASSISTANT: &str = "assistant";

    pub const STOP_END_TURN: &str = "end_turn";
    pub const STOP_MAX_TOKENS: &str = "max_tokens";
    pub const STOP_TOOL_USE: &str = "tool_use";

    pub const THINKING_ENABLED: &str = "enabled";
    pub const THINKING_DISABLED: &str = "disabled";

    pub const TOOL_CHOICE_AUTO: &str = "auto";
    pub const TOOL_CHOICE_ANY: &str = "any";
    pub const TOOL_CHOICE_TOOL: &str = "tool";
    pub const TOOL_CHOICE_NONE: &str = "none";
}

// ============================================================================
// Content Block Types
// ============================================================================

/// Image source: inline base64 or a URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaudeImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ClaudeImageSource {
    /// URL or data URI for the image.
    pub fn to_url(&self) -> Option<String> {
        match self.source_type.as_str() {
            "base64" => {
                let data = self.data.as_deref()?;
                let media_type = self.media_type.as_deref().unwrap_or("image/png");
                Some(format!("data:{};base64,{}", media_type, data))
            }
            _ => self.url.clone(),
        }
    }
}

/// Inbound content block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ClaudeImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
    #[serde(other)]
    Unknown,
}

/// Content that can be either a string or a list of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ClaudeMessageContent {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: ClaudeMessageContent,
}

// ============================================================================
// Tool Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// Extended thinking request parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaudeThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<i64>,
}

// ============================================================================
// Request Types
// ============================================================================

/// System block; text and image blocks are honored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaudeSystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ClaudeImageSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ClaudeSystemPrompt {
    Text(String),
    Blocks(Vec<ClaudeSystemBlock>),
}

/// Messages API request.
///
/// `model` and `messages` are optional here so their absence is reported as
/// an invalid request rather than a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClaudeMessagesRequest {
    #[serde(default)]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ClaudeMessage>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<ClaudeSystemPrompt>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    #[serde(default)]
    pub stream: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Accepted and ignored; the upstream has no equivalent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ClaudeThinkingConfig>,
}

/// Token counting request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClaudeTokenCountRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ClaudeMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<ClaudeSystemPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClaudeUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// Outbound content block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeResponseBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

impl ClaudeResponseBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ClaudeResponseBlock::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaudeResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ClaudeResponseBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

impl ClaudeResponse {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        content: Vec<ClaudeResponseBlock>,
        stop_reason: impl Into<String>,
        usage: ClaudeUsage,
    ) -> Self {
        Self {
            id: id.into(),
            response_type: "message".to_string(),
            role: constants::ROLE_ASSISTANT.to_string(),
            content,
            model: model.into(),
            stop_reason: Some(stop_reason.into()),
            stop_sequence: None,
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaudeTokenCountResponse {
    pub input_tokens: u64,
}
