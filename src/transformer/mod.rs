//! Protocol conversion.
//!
//! Every inbound request is normalized into the canonical model before the
//! upstream sees it, and every upstream reply is either forwarded (Protocol A)
//! or transcoded (Protocol B):
//!
//! ```text
//! Protocol-A body ──► CanonicalRequest::from_chat_body ─┐
//!                                                       ├─► CanonicalRequest ──► to_upstream_body ──► upstream
//! Protocol-B body ──► services::claude_converter ───────┘
//!
//! upstream SSE ──► sse::sse_events ──► StreamDelta ──► StreamState::step ──► Protocol-B events
//! ```

pub mod canonical;
pub mod sse;
pub mod stream;

pub use canonical::{
    CanonicalRequest, ContentBlock, Message, Role, StopSequences, ThinkingConfig, ThinkingLevel,
    ThinkingMode, ToolChoice, ToolSpec,
};
pub use sse::{format_sse_data, format_sse_done, format_sse_event, sse_events, SseEvent, SseParser};
pub use stream::{
    ChunkAccumulator, StreamDelta, StreamEvent, StreamInput, StreamState, StreamUsage,
};

/// Wire protocol spoken by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// chat/completions
    OpenAI,
    /// messages
    Anthropic,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAI => "openai",
            Protocol::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
