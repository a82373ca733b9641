//! Post-processing of a converged run
//!
//! Two independent single-turn generations over the summary, issued
//! concurrently: a short fragment title and the user-facing reply.

use crate::prompt::{RESPONSE_PROMPT, TITLE_PROMPT};
use kiln_agent::{ChatMessage, LlmClient, LlmRequest, LlmResponse, ModelParams, ThrottledInvoker};
use kiln_core::{MessageType, ModelSettings, Result, RunState};
use std::sync::Arc;
use tracing::debug;

/// Title used when the generator gives no text
pub const DEFAULT_TITLE: &str = "Fragment";

/// Reply used when the generator gives no text
pub const DEFAULT_RESPONSE: &str = "Here you go";

/// Content persisted for failed jobs
pub const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";

/// Generated title and reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessOutput {
    pub title: String,
    pub response: String,
}

/// Text of the first output message, parts concatenated, or `default`
pub fn extract_text(response: &LlmResponse, default: &str) -> String {
    response
        .first_text()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// How a finished run is persisted
///
/// A run without a usable summary or without files is an error: the product's
/// value is the generated artifact.
pub fn classify_outcome(state: &RunState) -> MessageType {
    if !state.has_summary() || state.files.is_empty() {
        MessageType::Error
    } else {
        MessageType::Result
    }
}

/// Runs the title and response generators
pub struct PostProcessor {
    llm: Arc<dyn LlmClient>,
    invoker: ThrottledInvoker,
    params: ModelParams,
}

impl PostProcessor {
    pub fn new(llm: Arc<dyn LlmClient>, invoker: ThrottledInvoker, settings: &ModelSettings) -> Self {
        Self {
            llm,
            invoker,
            params: ModelParams::from(settings),
        }
    }

    async fn generate(
        &self,
        label: &str,
        system_prompt: &str,
        summary: &str,
        default: &str,
    ) -> Result<String> {
        let request = LlmRequest::new(
            system_prompt,
            vec![ChatMessage::user(summary)],
            self.params.clone(),
        );
        let response = self
            .invoker
            .run(label, || self.llm.invoke(&request))
            .await?;
        let text = extract_text(&response, default);
        debug!("[{}] generated {} chars", label, text.len());
        Ok(text)
    }

    /// Generate the fragment title
    pub async fn title(&self, summary: &str) -> Result<String> {
        self.generate("fragment-title-run", TITLE_PROMPT, summary, DEFAULT_TITLE)
            .await
    }

    /// Generate the user-facing reply
    pub async fn response(&self, summary: &str) -> Result<String> {
        self.generate(
            "response-generator-run",
            RESPONSE_PROMPT,
            summary,
            DEFAULT_RESPONSE,
        )
        .await
    }

    /// Generate both concurrently; neither touches `RunState`
    pub async fn run(&self, summary: &str) -> Result<PostProcessOutput> {
        let (title, response) = tokio::join!(self.title(summary), self.response(summary));
        Ok(PostProcessOutput {
            title: title?,
            response: response?,
        })
    }
}
