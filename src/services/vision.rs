//! Vision fallback policy.
//!
//! When a request carries images but targets a text-only model, the gateway
//! either asks a vision model to describe the images and forwards the
//! description to the original model (two-stage), or substitutes the vision
//! model outright. The decisions here are pure; the upstream client performs
//! the calls.

use crate::core::config::ModelPolicyConfig;
use crate::transformer::{CanonicalRequest, ContentBlock, Message, Role};

/// Models known to accept images.
const KNOWN_VISION_MODELS: &[&str] = &["qwen3-vl-plus", "tstars2.0"];

/// Name fragments that mark a model as multimodal.
const VISION_NAME_HINTS: &[&str] = &["-vl", "vl-", "vision", "4v", "multimodal", "omni"];

/// Text-only families that get image descriptions instead of a model swap.
pub const TWO_STAGE_FAMILIES: &[&str] = &["glm-", "minimax-", "deepseek-", "kimi-", "qwen3-"];

/// Upstream statuses that can signal "this model does not take images".
const VISION_ERROR_STATUSES: &[u16] = &[400, 415, 422];

/// Error-text fragments that identify an image rejection.
const VISION_ERROR_KEYWORDS: &[&str] = &[
    "image",
    "vision",
    "multimodal",
    "multi-modal",
    "visual",
    "picture",
    "图片",
    "图像",
    "多模态",
];

/// Upper bound on description tokens requested from the vision model.
pub const DESCRIBE_MAX_TOKENS: u32 = 2048;

const DESCRIBE_PROMPT: &str = "Describe every attached image in order, labelling them Image #1, Image #2 and so on. \
Transcribe all visible text, code, error messages and UI labels exactly. \
Describe layout, diagrams, charts and any details needed to answer questions about the images. \
Do not answer the user's question; only describe.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionPlan {
    /// Send as-is.
    Direct,
    /// Send as-is, swap to the vision model if the upstream rejects images.
    DirectWithSubstitution,
    /// Describe images with the vision model first.
    TwoStage,
}

impl VisionPlan {
    pub fn metric_label(&self) -> &'static str {
        match self {
            VisionPlan::Direct => "direct",
            VisionPlan::DirectWithSubstitution => "substitution",
            VisionPlan::TwoStage => "two_stage",
        }
    }
}

pub fn is_vision_model(model: &str, policy: &ModelPolicyConfig) -> bool {
    let lower = model.to_ascii_lowercase();
    if lower == policy.vision_model.to_ascii_lowercase()
        || KNOWN_VISION_MODELS.iter().any(|m| lower == *m)
    {
        return true;
    }
    VISION_NAME_HINTS.iter().any(|hint| lower.contains(hint))
}

pub fn supports_two_stage(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    TWO_STAGE_FAMILIES.iter().any(|f| lower.starts_with(f))
}

pub fn plan(request: &CanonicalRequest, policy: &ModelPolicyConfig) -> VisionPlan {
    if !request.has_images() || !policy.auto_vision_model {
        return VisionPlan::Direct;
    }
    if is_vision_model(&request.model, policy) {
        return VisionPlan::Direct;
    }
    if supports_two_stage(&request.model) {
        VisionPlan::TwoStage
    } else {
        VisionPlan::DirectWithSubstitution
    }
}

/// Whether an upstream error looks like an image rejection.
pub fn is_vision_rejection(status: u16, message: &str) -> bool {
    if !VISION_ERROR_STATUSES.contains(&status) {
        return false;
    }
    let lower = message.to_lowercase();
    VISION_ERROR_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Same request aimed at the vision model.
pub fn substitute_model(request: &CanonicalRequest, policy: &ModelPolicyConfig) -> CanonicalRequest {
    CanonicalRequest {
        model: policy.vision_model.clone(),
        thinking: None,
        ..request.clone()
    }
}

/// Reduced request asking the vision model to describe the images.
///
/// Only user messages that carry images are kept, stripped to their text and
/// image blocks.
pub fn describe_request(request: &CanonicalRequest, policy: &ModelPolicyConfig) -> CanonicalRequest {
    let mut messages = vec![Message::system(DESCRIBE_PROMPT)];
    for message in request.messages.iter().filter(|m| m.role == Role::User && m.has_images()) {
        let content: Vec<ContentBlock> = message
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::Text { .. } | ContentBlock::Image { .. }))
            .cloned()
            .collect();
        messages.push(Message::new(Role::User, content));
    }

    let mut describe = CanonicalRequest::new(policy.vision_model.clone(), messages);
    describe.max_tokens = DESCRIBE_MAX_TOKENS;
    describe
}

/// Original request with images replaced by numbered placeholders and the
/// vision model's description added as a bridging system message.
pub fn bridge_with_description(request: &CanonicalRequest, description: &str) -> CanonicalRequest {
    let mut bridged = request.clone();
    let mut counter = 0;
    for message in bridged.messages.iter_mut() {
        for block in message.content.iter_mut() {
            if block.is_image() {
                counter += 1;
                *block = ContentBlock::text(format!("[Image #{}]", counter));
            }
        }
    }

    let note = format!(
        "The user attached {} image(s). A vision model described them as follows; \
treat this description as what the images show.\n\n{}",
        counter,
        description.trim()
    );
    let insert_at = bridged
        .messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    bridged.messages.insert(insert_at, Message::system(note));
    bridged
}
