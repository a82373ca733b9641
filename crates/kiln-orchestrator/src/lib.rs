//! # kiln-orchestrator
//!
//! Agent run orchestration for Kiln.
//!
//! This crate provides:
//! - The tool set exposed to the coding agent
//! - The router state machine and the two-pass agent run loop
//! - Title and response generation over a converged summary
//! - The conversation store seam
//! - The job entry point for code, Q&A and search jobs
//!
//! ## Run State
//!
//! Each job owns one [`kiln_core::RunState`]. It is passed by `&mut` into
//! every tool call and router decision, so nothing is shared between jobs and
//! no locking is needed inside a job.

mod job;
mod loop_engine;
mod post_process;
mod prompt;
mod search;
mod state_machine;
mod store;
mod tools;

pub use job::{JobRunner, QA_DEFAULT_RESPONSE};
pub use loop_engine::{AgentRunLoop, LoopReport, Pass, TurnLog, TurnRecord};
pub use post_process::{
    classify_outcome, extract_text, PostProcessOutput, PostProcessor, DEFAULT_RESPONSE,
    DEFAULT_TITLE, GENERIC_FAILURE,
};
pub use prompt::{
    artifact_pass_input, build_search_prompt, history_to_chat, render_transcript,
    CODE_AGENT_PROMPT, QA_PROMPT, RESPONSE_PROMPT, SEARCH_SYSTEM_LINE, TITLE_PROMPT,
};
pub use search::{HttpSearchAgent, SearchAgent, StaticSearchAgent, SEARCH_APOLOGY};
pub use state_machine::{transition, Action, Event, State};
pub use store::{ConversationStore, FileConversationStore, InMemoryConversationStore};
pub use tools::{FileEntry, ToolKind, ToolOutput, ToolSet};
