//! # kiln-agent
//!
//! LLM client and throttled invoker for Kiln agent runs.
//!
//! ## Key Pattern
//!
//! Every provider call goes through a [`ThrottledInvoker`]. Clients make one
//! attempt per call and report throttling as structured provider errors; the
//! invoker decides whether and how long to wait:
//! - Token-limit and request-rate errors retry indefinitely
//! - Oversized payloads retry a bounded number of times
//! - Everything else propagates on the first attempt

mod client;
mod throttle;
mod types;

pub use client::{LlmClient, OpenAiClient, ScriptedLlmClient, ScriptedReply};
pub use throttle::{
    classify, retry_hint, RetryAttemptContext, RetryDecision, RetryLogger, ThrottleClass,
    ThrottledInvoker, TracingRetryLogger, MAX_WAIT_SECS, RATE_LIMIT_JITTER,
};
pub use types::*;
