//! Agent run loop - drives one tool-using agent to convergence
//!
//! Each turn is one LLM call over the running conversation. Tool calls from
//! that turn run sequentially against `RunState` and their results are appended
//! to the conversation before the next turn. The router state machine decides
//! after every turn whether to continue.
//!
//! A full run is two passes over the same conversation and state:
//! 1. The user input as given
//! 2. A restated "write the following snippet" input, which forces an
//!    artifact-producing pass when the first converged on a plan only
//!
//! Every turn is recorded in a `TurnLog` so the final summary can fall back to
//! the last assistant text seen anywhere in the run.

use crate::prompt::{artifact_pass_input, CODE_AGENT_PROMPT};
use crate::state_machine::{transition, Action, Event, State};
use crate::tools::ToolSet;
use kiln_agent::{ChatMessage, ChatRole, LlmClient, LlmRequest, ModelParams, ThrottledInvoker};
use kiln_core::{AgentSettings, KilnError, Result, RunState};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which pass of a run produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Initial,
    Artifact,
}

impl Pass {
    fn label(&self) -> &'static str {
        match self {
            Pass::Initial => "initial-network-run",
            Pass::Artifact => "final-network-run",
        }
    }
}

/// One message produced during a run
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub pass: Pass,
    /// 1-indexed turn within the pass
    pub turn: usize,
    pub role: ChatRole,
    pub content: Option<String>,
    /// Names of tools requested in this message
    pub tool_calls: Vec<String>,
}

/// Ordered record of every message the run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnLog {
    records: Vec<TurnRecord>,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TurnRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[TurnRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Scan backwards for the last non-blank assistant text
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.role == ChatRole::Assistant)
            .filter_map(|r| r.content.as_deref())
            .find(|text| !text.trim().is_empty())
    }
}

/// Outcome of a full two-pass run
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    /// Router state at the end of the first pass
    pub initial: State,
    /// Router state at the end of the artifact pass, when it ran
    pub artifact: Option<State>,
    pub turn_log: TurnLog,
    /// Final summary (also stored in `RunState.summary`)
    pub summary: String,
}

/// Loop engine for one coding agent
pub struct AgentRunLoop {
    llm: Arc<dyn LlmClient>,
    invoker: ThrottledInvoker,
    settings: AgentSettings,
    system_prompt: String,
}

impl AgentRunLoop {
    pub fn new(llm: Arc<dyn LlmClient>, invoker: ThrottledInvoker, settings: AgentSettings) -> Self {
        Self {
            llm,
            invoker,
            settings,
            system_prompt: CODE_AGENT_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Run both passes and settle the final summary
    ///
    /// The summary is the artifact pass's, else the initial pass's, else the
    /// last assistant text in the turn log. With none of those the run fails
    /// with `KilnError::Convergence`.
    pub async fn run(
        &self,
        history: Vec<ChatMessage>,
        user_input: &str,
        state: &mut RunState,
        tools: &ToolSet,
    ) -> Result<LoopReport> {
        let mut conversation = history;
        let mut turn_log = TurnLog::new();

        let initial = self
            .run_pass(
                Pass::Initial,
                &mut conversation,
                user_input,
                state,
                tools,
                &mut turn_log,
            )
            .await?;
        let initial_summary = std::mem::take(&mut state.summary);

        let artifact = if self.settings.artifact_pass {
            let input = artifact_pass_input(user_input);
            Some(
                self.run_pass(
                    Pass::Artifact,
                    &mut conversation,
                    &input,
                    state,
                    tools,
                    &mut turn_log,
                )
                .await?,
            )
        } else {
            None
        };
        let artifact_summary = std::mem::take(&mut state.summary);

        let summary = [artifact_summary, initial_summary]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .or_else(|| {
                let recovered = turn_log.last_assistant_text().map(String::from);
                if recovered.is_some() {
                    warn!("No converged summary; recovered from turn log");
                }
                recovered
            })
            .ok_or_else(|| {
                KilnError::Convergence(
                    "No assistant output found; cannot proceed without a summary".to_string(),
                )
            })?;

        state.summary = summary.clone();
        info!(
            "Agent run complete: {} turn record(s), {} file(s)",
            turn_log.len(),
            state.files.len()
        );

        Ok(LoopReport {
            initial,
            artifact,
            turn_log,
            summary,
        })
    }

    /// Run one pass from `RUNNING` until the router stops
    ///
    /// Appends `input` as a user message, then issues turns. `state.summary` is
    /// expected empty on entry.
    pub async fn run_pass(
        &self,
        pass: Pass,
        conversation: &mut Vec<ChatMessage>,
        input: &str,
        state: &mut RunState,
        tools: &ToolSet,
        turn_log: &mut TurnLog,
    ) -> Result<State> {
        info!("Starting {:?} pass (max {} turns)", pass, self.settings.max_iterations);
        conversation.push(ChatMessage::user(input));

        let params = ModelParams::from(&self.settings);
        let definitions = tools.definitions();
        let mut router = State::initial();

        while !router.is_terminal() {
            let turn = router.turns() + 1;
            debug!("{:?} pass turn {}", pass, turn);

            let request = LlmRequest::new(
                self.system_prompt.clone(),
                conversation.clone(),
                params.clone(),
            )
            .with_tools(definitions.clone());

            let response = self
                .invoker
                .run(pass.label(), || self.llm.invoke(&request))
                .await?;

            let mut assistant_text = None;
            for message in response.output {
                turn_log.push(TurnRecord {
                    pass,
                    turn,
                    role: message.role,
                    content: message.text(),
                    tool_calls: message.tool_calls.iter().map(|c| c.name.clone()).collect(),
                });

                if message.is_assistant_text() {
                    assistant_text = message.text();
                }

                let calls = message.tool_calls.clone();
                conversation.push(message);

                // Tool calls run strictly in order; results go back to the agent
                for call in calls {
                    let output = tools.dispatch(&call, state).await;
                    if output.failed {
                        debug!("Tool {} returned an error", call.name);
                    }
                    let content = output.to_message_content();
                    turn_log.push(TurnRecord {
                        pass,
                        turn,
                        role: ChatRole::Tool,
                        content: Some(content.clone()),
                        tool_calls: Vec::new(),
                    });
                    conversation.push(ChatMessage::tool_result(call.id, content));
                }
            }

            let event = Event::TurnCompleted {
                summary_present: state.has_summary(),
                assistant_text,
            };
            let (next, actions) = transition(router, event, self.settings.max_iterations);
            router = next;

            for action in actions {
                match action {
                    Action::CaptureSummary { text } => state.summary = text,
                    Action::LogActivity { message } => info!("{:?} pass: {}", pass, message),
                    Action::IssueTurn => {}
                }
            }
        }

        info!("{:?} pass ended in {} after {} turn(s)", pass, router.name(), router.turns());
        Ok(router)
    }
}
