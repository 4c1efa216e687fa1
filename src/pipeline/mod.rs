//! Moderation pipeline.
//!
//! Every new request's message flows through:
//! 1. `FilterPipeline::submit()`: bounded concurrent call to the moderation endpoint
//! 2. result channel: one `FilterResult` per submission, arrival order
//! 3. `spawn_result_consumer()`: single task applying results to stored requests
//!
//! A result only moves a request that is still pending.

pub mod client;
pub mod consumer;
pub mod processor;
pub mod types;

pub use client::{HttpModerationClient, ModerationClient};
pub use consumer::spawn_result_consumer;
pub use processor::FilterPipeline;
pub use types::{FilterResult, ModerationVerdict};
