//! Shared constants for structured API errors.

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";
pub const ERROR_TYPE_UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
pub const ERROR_TYPE_INTERNAL: &str = "internal_error";

/// Upstream error messages longer than this are cut before they reach a client or a log line.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Outcome labels used by the upstream attempt counter.
pub const ATTEMPT_OUTCOME_OK: &str = "ok";
pub const ATTEMPT_OUTCOME_RETRYABLE: &str = "retryable";
pub const ATTEMPT_OUTCOME_FATAL: &str = "fatal";
