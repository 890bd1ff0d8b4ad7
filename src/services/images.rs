//! Image reference normalization.
//!
//! Data URIs and http(s) URLs go upstream untouched. Local references
//! (`file://`, absolute paths, drive paths) are inlined as base64 data URIs
//! only when the operator allows it; otherwise they are left as-is and a
//! warning is logged.

use crate::core::config::ModelPolicyConfig;
use crate::transformer::{ContentBlock, Message};
use base64::Engine;

fn is_remote_or_inline(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("data:") || lower.starts_with("http://") || lower.starts_with("https://")
}

/// Filesystem path for a local image reference, if it is one.
pub fn local_path(url: &str) -> Option<&str> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(rest);
    }
    let bytes = url.as_bytes();
    let is_drive =
        bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && matches!(bytes[2], b'\\' | b'/');
    (url.starts_with('/') || is_drive).then_some(url)
}

async fn inline_file(path: &str, max_bytes: u64) -> Result<String, String> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("cannot stat: {}", e))?;
    if !meta.is_file() {
        return Err("not a regular file".to_string());
    }
    if meta.len() > max_bytes {
        return Err(format!("{} bytes exceeds limit of {}", meta.len(), max_bytes));
    }
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| format!("cannot read: {}", e))?;
    let mime = mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
        .filter(|m| m.starts_with("image/"))
        .unwrap_or_else(|| "image/png".to_string());
    Ok(format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(data)
    ))
}

/// Inline local image references in place.
pub async fn resolve_local_images(messages: &mut [Message], policy: &ModelPolicyConfig) {
    for message in messages.iter_mut() {
        for block in message.content.iter_mut() {
            let ContentBlock::Image { url, .. } = block else {
                continue;
            };
            if is_remote_or_inline(url) {
                continue;
            }
            let Some(path) = local_path(url).map(str::to_string) else {
                continue;
            };
            if !policy.allow_local_file_images {
                tracing::warn!(path = %path, "Local image reference left unresolved; local file images are disabled");
                continue;
            }
            match inline_file(&path, policy.max_local_image_bytes).await {
                Ok(data_uri) => {
                    tracing::debug!(path = %path, "Inlined local image");
                    *url = data_uri;
                }
                Err(reason) => {
                    tracing::warn!(path = %path, reason = %reason, "Skipping local image");
                }
            }
        }
    }
}
