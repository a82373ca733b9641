//! # kiln-sandbox
//!
//! Remote sandbox access for Kiln agent runs.
//!
//! This crate provides:
//! - Sandbox handle and provider abstractions
//! - An HTTP client for the sandbox platform
//! - An in-memory sandbox for tests

mod http;
mod memory;
mod provider;

pub use http::{HttpSandbox, HttpSandboxProvider};
pub use memory::{InMemorySandbox, InMemorySandboxProvider, ScriptedCommand};
pub use provider::{CommandOutput, OutputCallback, SandboxHandle, SandboxProvider};
