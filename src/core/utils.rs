//! Small text helpers shared by logging, errors and the request log.

use serde_json::Value;

/// Truncate `text` to at most `limit` characters, appending a marker when cut.
///
/// # Examples
///
/// ```
/// use iflow_proxy_rust::core::utils::truncate_text;
///
/// assert_eq!(truncate_text("hello", 10), "hello");
/// assert_eq!(truncate_text("hello world", 5), "hello...(truncated)");
/// ```
pub fn truncate_text(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => format!("{}...(truncated)", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Serialize a JSON value and truncate it for logging.
pub fn truncate_json(value: &Value, limit: usize) -> String {
    let text = serde_json::to_string(value).unwrap_or_default();
    truncate_text(&text, limit)
}

/// Pull a human-readable message out of an upstream error body.
///
/// Looks at `error.message`, `error` (string), `message`, `msg` and `detail` in
/// that order.
pub fn extract_error_message(body: &Value) -> Option<String> {
    if let Some(error) = body.get("error") {
        if let Some(msg) = error.get("message").and_then(|m| m.as_str()) {
            return Some(msg.to_string());
        }
        if let Some(msg) = error.as_str() {
            return Some(msg.to_string());
        }
    }
    ["message", "msg", "detail"]
        .iter()
        .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}
