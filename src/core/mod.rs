//! Core functionality for the gateway.
//!
//! This module contains the ambient pieces used throughout the crate:
//! - Configuration
//! - Error handling
//! - Upstream credentials
//! - Logging context, request log and metrics
//! - Header policy and stream cancellation

pub mod cancel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod error_types;
pub mod header_policy;
pub mod logging;
pub mod metrics;
pub mod request_logger;
pub mod utils;

// Re-export commonly used types
pub use cancel::StreamCancelHandle;
pub use config::AppConfig;
pub use credentials::{
    BearerToken, CredentialProvider, StaticCredentialProvider, Token, TokenFileCredentialProvider,
};
pub use error::{AppError, Result};
pub use logging::{generate_message_id, generate_request_id, get_request_id, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use request_logger::{ObservabilitySink, RequestLog, RequestLogEntry, RequestStats};
