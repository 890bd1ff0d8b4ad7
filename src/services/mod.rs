//! Business logic services for the gateway.
//!
//! Everything between a parsed inbound request and upstream bytes lives here:
//! Protocol-B conversion, reasoning resolution, context compression, vision
//! fallback, the upstream client and the continuation controller.

pub mod claude_converter;
pub mod compressor;
pub mod continuation;
pub mod images;
pub mod system_prompt;
pub mod thinking;
pub mod upstream_client;
pub mod vision;

// Re-export commonly used types
pub use compressor::{CompressionStats, CompressionStrategy, SlidingWindowCompressor};
pub use continuation::ContinuationController;
pub use upstream_client::{Completion, RetryPolicy, UpstreamClient, UpstreamStream};
pub use vision::VisionPlan;
