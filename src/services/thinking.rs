//! Reasoning configuration resolution and provider encoding.
//!
//! A request can ask for reasoning in three places, checked in order:
//!
//! 1. a model-name suffix, `glm-4.7(high)` / `glm-4.7(8192)` / `glm-4.7(none)`
//! 2. provider-native fields (`chat_template_kwargs.enable_thinking`,
//!    `reasoning_split`)
//! 3. generic fields (`reasoning_effort`, or a `thinking` object)
//!
//! The first source that yields a config wins. The config is then encoded in
//! the target family's dialect and every other reasoning field is removed.

use crate::transformer::{CanonicalRequest, ThinkingConfig, ThinkingLevel};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};

lazy_static! {
    static ref SUFFIX_RE: Regex = Regex::new(r"^(.+)\(([^)]+)\)$").expect("valid suffix regex");
}

/// Families whose previous-turn reasoning is sent back upstream.
const REASONING_PRESERVING_FAMILIES: &[&str] = &["glm-4", "glm-5", "minimax-m2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Glm,
    MiniMax,
    Other,
}

impl ModelFamily {
    pub fn of(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("glm") {
            ModelFamily::Glm
        } else if lower.starts_with("minimax") {
            ModelFamily::MiniMax
        } else {
            ModelFamily::Other
        }
    }
}

pub fn preserves_reasoning(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    REASONING_PRESERVING_FAMILIES
        .iter()
        .any(|family| lower.starts_with(family))
}

/// Map a token budget to an effort name.
pub fn budget_to_effort(budget: i64) -> &'static str {
    match budget {
        b if b < 0 => "auto",
        0 => "none",
        b if b < 5000 => "low",
        b if b < 15000 => "medium",
        _ => "high",
    }
}

/// Split `base(suffix)` into its parts.
pub fn split_suffix(model: &str) -> Option<(&str, &str)> {
    let caps = SUFFIX_RE.captures(model)?;
    let base = caps.get(1)?.as_str();
    let suffix = caps.get(2)?.as_str();
    Some((base, suffix))
}

/// Interpret a suffix value. Unrecognized values yield `None`.
pub fn config_from_suffix(suffix: &str) -> Option<ThinkingConfig> {
    let value = suffix.trim().to_ascii_lowercase();
    match value.as_str() {
        "none" => return Some(ThinkingConfig::none()),
        "auto" | "-1" => return Some(ThinkingConfig::auto()),
        _ => {}
    }
    if let Some(level) = ThinkingLevel::parse(&value) {
        return Some(ThinkingConfig::level(level));
    }
    match value.parse::<i64>() {
        Ok(0) => Some(ThinkingConfig::none()),
        Ok(n) if n > 0 => Some(ThinkingConfig::budget(n)),
        _ => None,
    }
}

fn config_from_native(extra: &Map<String, Value>) -> Option<ThinkingConfig> {
    let flag = extra
        .get("chat_template_kwargs")
        .and_then(|kw| kw.get("enable_thinking"))
        .and_then(Value::as_bool)
        .or_else(|| extra.get("reasoning_split").and_then(Value::as_bool))?;
    Some(if flag {
        ThinkingConfig::auto()
    } else {
        ThinkingConfig::none()
    })
}

fn config_from_effort(effort: &str) -> Option<ThinkingConfig> {
    let effort = effort.trim().to_ascii_lowercase();
    match effort.as_str() {
        "none" => Some(ThinkingConfig::none()),
        "auto" => Some(ThinkingConfig::auto()),
        other => ThinkingLevel::parse(other).map(ThinkingConfig::level),
    }
}

fn config_from_generic(extra: &Map<String, Value>) -> Option<ThinkingConfig> {
    if let Some(config) = extra
        .get("reasoning_effort")
        .and_then(Value::as_str)
        .and_then(config_from_effort)
    {
        return Some(config);
    }
    let thinking = extra.get("thinking")?;
    match thinking.get("type").and_then(Value::as_str) {
        Some("disabled") => Some(ThinkingConfig::none()),
        Some("enabled") => Some(
            match thinking.get("budget_tokens").and_then(Value::as_i64) {
                Some(n) if n > 0 => ThinkingConfig::budget(n),
                Some(0) => ThinkingConfig::none(),
                _ => ThinkingConfig::auto(),
            },
        ),
        _ => None,
    }
}

/// Resolve the reasoning config onto the request.
///
/// A suffix is always stripped from the model name; only a recognized one
/// yields a config. When any source
/// yields a config the generic fields are consumed so they never reach the
/// upstream in their raw form.
pub fn resolve(request: &mut CanonicalRequest) {
    let mut config = None;

    if let Some((base, suffix)) = split_suffix(&request.model) {
        config = config_from_suffix(suffix);
        let base = base.to_string();
        tracing::debug!(
            model = %request.model,
            base = %base,
            recognized = config.is_some(),
            "Stripped reasoning suffix"
        );
        request.model = base;
    }

    let config = config
        .or_else(|| config_from_native(&request.extra))
        .or_else(|| config_from_generic(&request.extra));

    if config.is_some() {
        request.extra.remove("reasoning_effort");
        request.extra.remove("thinking");
    }
    request.thinking = config;
}

fn strip_reasoning_fields(body: &mut Map<String, Value>) {
    if let Some(Value::Object(kwargs)) = body.get_mut("chat_template_kwargs") {
        kwargs.remove("enable_thinking");
        kwargs.remove("clear_thinking");
        if kwargs.is_empty() {
            body.remove("chat_template_kwargs");
        }
    }
    body.remove("reasoning_split");
    body.remove("reasoning_effort");
    body.remove("thinking");
}

/// Encode `config` into an upstream body for `model`'s family.
///
/// GLM and MiniMax keep the upstream default when no config was resolved;
/// other families never see reasoning fields.
pub fn apply_encoding(body: &mut Map<String, Value>, model: &str, config: Option<&ThinkingConfig>) {
    let family = ModelFamily::of(model);
    let Some(config) = config else {
        if family == ModelFamily::Other {
            strip_reasoning_fields(body);
        }
        return;
    };

    let enabled = config.is_enabled();
    strip_reasoning_fields(body);
    match family {
        ModelFamily::Glm => {
            let kwargs = body
                .entry("chat_template_kwargs")
                .or_insert_with(|| json!({}));
            if let Value::Object(kwargs) = kwargs {
                kwargs.insert("enable_thinking".into(), json!(enabled));
                if enabled {
                    kwargs.insert("clear_thinking".into(), json!(false));
                }
            }
        }
        ModelFamily::MiniMax => {
            body.insert("reasoning_split".into(), json!(enabled));
        }
        ModelFamily::Other => {}
    }
}
