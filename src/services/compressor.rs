//! Context-window compression.
//!
//! Token counts are estimated with a character heuristic: CJK characters
//! weigh more than Latin text, and each message carries a fixed framing
//! overhead. The estimate only has to be stable and roughly proportional.

use crate::transformer::{CanonicalRequest, ContentBlock, Message, Role};

/// Framing overhead added per message.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// Flat estimate for one image.
pub const IMAGE_TOKEN_ESTIMATE: usize = 256;

// Weights in twentieths of a token: CJK 0.6, everything else 0.25.
const CJK_WEIGHT: usize = 12;
const OTHER_WEIGHT: usize = 5;
const WEIGHT_SCALE: usize = 20;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF
        | 0x3400..=0x4DBF
        | 0x3040..=0x30FF
        | 0xAC00..=0xD7AF
        | 0xF900..=0xFAFF
        | 0x3000..=0x303F
        | 0xFF00..=0xFFEF)
}

pub fn estimate_text_tokens(text: &str) -> usize {
    let weight: usize = text
        .chars()
        .map(|c| if is_cjk(c) { CJK_WEIGHT } else { OTHER_WEIGHT })
        .sum();
    weight.div_ceil(WEIGHT_SCALE)
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    let content: usize = message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => estimate_text_tokens(text),
            ContentBlock::Image { .. } => IMAGE_TOKEN_ESTIMATE,
            ContentBlock::ToolUse { name, input, .. } => {
                estimate_text_tokens(name) + estimate_text_tokens(&input.to_string())
            }
            ContentBlock::ToolResult { content, .. } => estimate_text_tokens(content),
            ContentBlock::Thinking { thinking } => estimate_text_tokens(thinking),
            ContentBlock::Raw(value) => estimate_text_tokens(&value.to_string()),
        })
        .sum();
    let reasoning = message
        .reasoning
        .as_deref()
        .map(estimate_text_tokens)
        .unwrap_or(0);
    MESSAGE_OVERHEAD_TOKENS + content + reasoning
}

pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimated input tokens for a whole request, tools included. Never zero.
pub fn estimate_request_tokens(request: &CanonicalRequest) -> usize {
    let tools: usize = request
        .tools
        .iter()
        .flatten()
        .map(|t| {
            estimate_text_tokens(&t.name)
                + t.description.as_deref().map(estimate_text_tokens).unwrap_or(0)
                + estimate_text_tokens(&t.parameters.to_string())
        })
        .sum();
    (estimate_messages(&request.messages) + tools).max(1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub removed_count: usize,
}

/// Shrinks a message list to fit a token budget.
///
/// Implementations return a suffix of their input, keep at least one message,
/// and never start the result with an orphaned tool result.
pub trait CompressionStrategy: Send + Sync {
    fn compress(&self, messages: Vec<Message>, budget: usize) -> (Vec<Message>, CompressionStats);
}

/// Keeps the longest tail of the conversation that fits.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindowCompressor;

impl CompressionStrategy for SlidingWindowCompressor {
    fn compress(
        &self,
        mut messages: Vec<Message>,
        budget: usize,
    ) -> (Vec<Message>, CompressionStats) {
        let costs: Vec<usize> = messages.iter().map(estimate_message_tokens).collect();
        let original_tokens: usize = costs.iter().sum();

        if original_tokens <= budget || messages.len() <= 1 {
            return (
                messages,
                CompressionStats {
                    original_tokens,
                    compressed_tokens: original_tokens,
                    removed_count: 0,
                },
            );
        }

        let mut kept_tokens = 0;
        let mut start = messages.len();
        for (i, cost) in costs.iter().enumerate().rev() {
            if kept_tokens + cost > budget {
                break;
            }
            kept_tokens += cost;
            start = i;
        }
        if start == messages.len() {
            start = messages.len() - 1;
        }
        while start < messages.len() - 1 && messages[start].role == Role::Tool {
            start += 1;
        }

        let kept = messages.split_off(start);
        let compressed_tokens = costs[start..].iter().sum();
        (
            kept,
            CompressionStats {
                original_tokens,
                compressed_tokens,
                removed_count: start,
            },
        )
    }
}

/// Compress a request's conversation in place.
///
/// Leading system messages are never removed; their cost is reserved from
/// the budget before the strategy sees the rest. `extra_reserved` covers
/// text added to the request after compression, such as the injected
/// operational prompt.
pub fn compress_request(
    request: &mut CanonicalRequest,
    budget: usize,
    extra_reserved: usize,
    strategy: &dyn CompressionStrategy,
) -> Option<CompressionStats> {
    let total = estimate_messages(&request.messages) + extra_reserved;
    if total <= budget {
        return None;
    }

    let system_len = request
        .messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    let mut messages = std::mem::take(&mut request.messages);
    let conversation = messages.split_off(system_len);
    let reserved = estimate_messages(&messages) + extra_reserved;

    let (kept, stats) = strategy.compress(conversation, budget.saturating_sub(reserved));
    messages.extend(kept);
    request.messages = messages;

    tracing::info!(
        model = %request.model,
        original_tokens = stats.original_tokens + reserved,
        compressed_tokens = stats.compressed_tokens + reserved,
        removed = stats.removed_count,
        budget,
        "Compressed conversation to fit context budget"
    );
    Some(stats)
}
