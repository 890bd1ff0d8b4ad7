//! API layer for the gateway.
//!
//! This module contains the HTTP handlers for both inbound protocols, the
//! Messages wire models and the SSE streaming plumbing.

pub mod claude;
pub mod claude_models;
pub mod disconnect;
pub mod handlers;
pub mod streaming;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Inbound body cap; inline base64 images make request bodies large.
pub const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

// Re-export commonly used types
pub use claude::{count_tokens, create_message};
pub use handlers::{chat_completions, health, list_models, metrics_handler, AppState};
pub use streaming::{sse_response, transcode_stream, StreamOutcome};

/// Build the gateway router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(handlers::CHAT_COMPLETIONS_PATH, post(chat_completions))
        .route(claude::MESSAGES_PATH, post(create_message))
        .route(claude::COUNT_TOKENS_PATH, post(count_tokens))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/v1/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
