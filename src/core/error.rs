//! Error types and handling for the gateway.
//!
//! [`AppError`] carries the gateway's error taxonomy. Every variant maps to one
//! HTTP status, and the response body is rendered in the envelope of whichever
//! wire protocol the caller spoke.

use crate::core::error_types::{
    ERROR_TYPE_AUTHENTICATION, ERROR_TYPE_INTERNAL, ERROR_TYPE_INVALID_REQUEST,
    ERROR_TYPE_UPSTREAM, ERROR_TYPE_UPSTREAM_UNAVAILABLE,
};
use crate::transformer::Protocol;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Main error type for the gateway.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed JSON, missing or empty `messages`, or any other caller mistake
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream answered with a non-2xx status after retries were exhausted
    #[error("Upstream API error: HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Network or timeout failure reaching the upstream after retries were exhausted
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// No usable upstream credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration and startup errors
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors inside the translation path
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected failure in translation logic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => ERROR_TYPE_INVALID_REQUEST,
            AppError::Upstream { .. } => ERROR_TYPE_UPSTREAM,
            AppError::UpstreamUnavailable(_) => ERROR_TYPE_UPSTREAM_UNAVAILABLE,
            AppError::Unauthorized(_) => ERROR_TYPE_AUTHENTICATION,
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                ERROR_TYPE_INTERNAL
            }
        }
    }

    /// Upstream HTTP status carried by this error, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            AppError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Message shown to the caller.
    pub fn client_message(&self) -> String {
        match self {
            AppError::InvalidRequest(msg) => msg.clone(),
            AppError::Upstream { status, message } if message.is_empty() => {
                format!("Upstream API error: HTTP {}", status)
            }
            other => other.to_string(),
        }
    }

    /// Build the error body in the envelope of `protocol`.
    pub fn to_protocol_body(&self, protocol: Protocol) -> Value {
        build_error_body(
            protocol,
            self.status_code(),
            self.error_type(),
            &self.client_message(),
        )
    }

    pub fn into_protocol_response(self, protocol: Protocol) -> Response {
        let status = self.status_code();
        let body = self.to_protocol_body(protocol);
        (status, Json(body)).into_response()
    }
}

/// Render an error envelope.
///
/// Protocol A: `{"error":{"message","type","code"}}`.
/// Protocol B: `{"type":"error","error":{"type","message"}}`.
pub fn build_error_body(
    protocol: Protocol,
    status: StatusCode,
    error_type: &str,
    message: &str,
) -> Value {
    match protocol {
        Protocol::OpenAI => json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16()
            }
        }),
        Protocol::Anthropic => json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message
            }
        }),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_protocol_response(Protocol::OpenAI)
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::InvalidRequest("messages is required".to_string());
        assert_eq!(err.to_string(), "Invalid request: messages is required");

        let err = AppError::Upstream {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream API error: HTTP 500: boom");

        let err = AppError::Internal("test error".to_string());
        assert_eq!(err.to_string(), "Internal error: test error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::InvalidRequest(String::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Upstream {
                status: 429,
                message: String::new()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::UpstreamUnavailable("timeout".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_message_without_detail() {
        let err = AppError::Upstream {
            status: 503,
            message: String::new(),
        };
        assert_eq!(err.client_message(), "Upstream API error: HTTP 503");
        assert_eq!(err.upstream_status(), Some(503));
    }

    #[test]
    fn test_openai_envelope() {
        let err = AppError::InvalidRequest("Invalid JSON".to_string());
        let body = err.to_protocol_body(Protocol::OpenAI);
        assert_eq!(body["error"]["message"], "Invalid JSON");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], 400);
    }

    #[test]
    fn test_anthropic_envelope() {
        let err = AppError::UpstreamUnavailable("connect refused".to_string());
        let body = err.to_protocol_body(Protocol::Anthropic);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "upstream_unavailable");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("connect refused"));
    }

    #[test]
    fn test_error_into_response() {
        let response = AppError::Unauthorized("no token".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = AppError::Upstream {
            status: 400,
            message: "bad".into(),
        }
        .into_protocol_response(Protocol::Anthropic);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
