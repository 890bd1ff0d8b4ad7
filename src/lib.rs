//! iFlow gateway - a local bridge between two chat wire protocols and an
//! OpenAI-shaped upstream
//!
//! Clients speak either OpenAI-style `chat/completions` or Anthropic-style
//! `messages`; the gateway normalizes both into one canonical request,
//! applies the upstream's quirks and transcodes replies back:
//!
//! - **Thinking-mode resolution**: model-name suffixes and native fields
//!   become per-family reasoning switches
//! - **Streaming transcoder**: an explicit state machine from chunk deltas to
//!   Messages events
//! - **Vision fallback**: two-stage image description or vision-model
//!   substitution for text-only models
//! - **Continuation**: replies cut off by length are continued and stitched
//! - **Context compression**: a sliding window keeps conversations inside the
//!   token budget
//!
//! # Architecture
//!
//! - [`core`]: config, errors, credentials, logging context, request log, metrics
//! - [`transformer`]: canonical model, SSE framing, stream state machine
//! - [`services`]: conversion, policies, upstream client, continuation
//! - [`api`]: HTTP handlers and the router
//!
//! # Configuration
//!
//! Everything comes from the environment (a `.env` file is honoured):
//! - `UPSTREAM_BASE_URL`: upstream base (default: https://apis.iflow.cn/v1)
//! - `IFLOW_API_KEY` or `TOKEN_FILE_PATH`: upstream credentials
//! - `HOST` / `PORT`: bind address (default: 0.0.0.0:8000)
//! - `VISION_MODEL`: fallback vision model (default: qwen3-vl-plus)
//! - `CONTEXT_TOKEN_BUDGET`, `MAX_CONTINUATIONS`, `REQUEST_TIMEOUT_SECS`, ...

pub mod api;
pub mod core;
pub mod services;
pub mod transformer;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState};
pub use core::{AppConfig, AppError, Result};
pub use services::UpstreamClient;
