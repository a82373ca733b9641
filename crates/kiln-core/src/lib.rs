//! # kiln-core
//!
//! Core types for the Kiln agent orchestration core.
//!
//! Kiln turns a natural-language request into a generated artifact: an LLM
//! agent works inside a remote sandbox, and the resulting files plus a live
//! preview URL are persisted to the project's conversation.
//!
//! ## Core Paradigm
//!
//! - One job owns one `RunState` and one sandbox for its lifetime
//! - Files accumulate monotonically; they are never rolled back
//! - Provider throttling is recovered locally, everything else propagates
//! - Every job leaves a persisted outcome, even when it fails

mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{
    AgentSettings, KilnConfig, LlmSettings, ModelSettings, RetryConfig, SandboxSettings,
    SearchSettings,
};
pub use error::{KilnError, ProviderError, Result};
pub use types::*;
