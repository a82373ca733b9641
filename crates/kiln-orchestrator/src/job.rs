//! Job entry point
//!
//! One job is one end-to-end run from trigger event to persisted message.
//! Every job persists exactly one assistant message: its outcome, or a
//! generic failure record when it aborts.

use crate::loop_engine::AgentRunLoop;
use crate::post_process::{classify_outcome, extract_text, PostProcessor, GENERIC_FAILURE};
use crate::prompt::{build_search_prompt, history_to_chat, render_transcript, QA_PROMPT};
use crate::search::{HttpSearchAgent, SearchAgent, SEARCH_APOLOGY};
use crate::store::{ConversationStore, FileConversationStore};
use crate::tools::ToolSet;
use kiln_agent::{ChatMessage, LlmClient, LlmRequest, ModelParams, OpenAiClient, ThrottledInvoker};
use kiln_core::fail_open::fail_open_with_retries;
use kiln_core::{
    FileMap, Fragment, JobEvent, JobOutcome, JobRequest, KilnConfig, KilnError, Message,
    MessageType, NewMessage, Result, RunState, TaskKind,
};
use kiln_sandbox::{HttpSandboxProvider, SandboxProvider};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Reply of the Q&A agent when the model gives no text
pub const QA_DEFAULT_RESPONSE: &str = "Here you go.";

/// Attempts at writing the failure record of an aborted job
const FAILURE_RECORD_ATTEMPTS: usize = 3;

/// Runs jobs against injected collaborators
pub struct JobRunner {
    config: KilnConfig,
    llm: Arc<dyn LlmClient>,
    sandboxes: Arc<dyn SandboxProvider>,
    store: Arc<dyn ConversationStore>,
    search: Arc<dyn SearchAgent>,
    invoker: ThrottledInvoker,
}

impl JobRunner {
    pub fn new(
        config: KilnConfig,
        llm: Arc<dyn LlmClient>,
        sandboxes: Arc<dyn SandboxProvider>,
        store: Arc<dyn ConversationStore>,
        search: Arc<dyn SearchAgent>,
    ) -> Self {
        let invoker = ThrottledInvoker::new(config.retry.clone());
        Self {
            config,
            llm,
            sandboxes,
            store,
            search,
            invoker,
        }
    }

    /// Wire up the HTTP clients and the file store under `data_dir`
    pub fn connect(config: KilnConfig, data_dir: &Path) -> Result<Self> {
        let llm = Arc::new(OpenAiClient::from_settings(&config.llm)?);
        let sandboxes = Arc::new(HttpSandboxProvider::from_settings(&config.sandbox)?);
        let store = Arc::new(FileConversationStore::new(data_dir));
        let search = Arc::new(HttpSearchAgent::from_settings(&config.search));
        Ok(Self::new(config, llm, sandboxes, store, search))
    }

    /// Replace the invoker (custom retry logger, test timings)
    pub fn with_invoker(mut self, invoker: ThrottledInvoker) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Dispatch a serialized trigger event
    pub async fn handle_event(&self, event: &JobEvent) -> Result<JobOutcome> {
        let kind = event
            .kind()
            .ok_or_else(|| KilnError::UnknownEvent(event.name.clone()))?;
        self.run(kind, event.data.clone()).await
    }

    /// Run one job
    ///
    /// An error escaping the job leaves a generic ERROR message behind and is
    /// then returned. Failing to write that record does not mask the error.
    #[instrument(skip_all, fields(project = %request.project_id, kind = %kind))]
    pub async fn run(&self, kind: TaskKind, request: JobRequest) -> Result<JobOutcome> {
        info!("Job started");
        let result = match kind {
            TaskKind::Code => self.run_code_job(&request).await,
            TaskKind::Qa => self.run_qa_job(&request).await,
            TaskKind::Search => self.run_search_job(&request).await,
        };

        match result {
            Ok(outcome) => {
                info!("Job finished: {} message {}", outcome.message_type, outcome.message_id);
                Ok(outcome)
            }
            Err(e) => {
                error!("Job failed: {}", e);
                let record =
                    NewMessage::assistant(&request.project_id, MessageType::Error, GENERIC_FAILURE);
                fail_open_with_retries(
                    "record_job_failure",
                    || self.persist(&request, record.clone()),
                    FAILURE_RECORD_ATTEMPTS,
                )
                .await;
                Err(e)
            }
        }
    }

    async fn run_code_job(&self, request: &JobRequest) -> Result<JobOutcome> {
        let sandboxes = &self.sandboxes;
        let template = self.config.sandbox.template.as_str();
        let sandbox = self
            .invoker
            .run("create-sandbox", || sandboxes.create(template))
            .await?;
        let sandbox_id = sandbox.id().to_string();
        info!("Using sandbox {}", sandbox_id);

        let history = self
            .store
            .messages_for_project(&request.project_id)
            .await?;

        let mut state = RunState::new();
        let tools = ToolSet::new(self.sandboxes.clone(), &sandbox_id);
        let agent = AgentRunLoop::new(
            self.llm.clone(),
            self.invoker.clone(),
            self.config.agent.clone(),
        );
        let report = agent
            .run(
                history_to_chat(&history),
                &request.user_input,
                &mut state,
                &tools,
            )
            .await?;

        let generated = PostProcessor::new(
            self.llm.clone(),
            self.invoker.clone(),
            &self.config.post_process,
        )
        .run(&report.summary)
        .await?;
        let message_type = classify_outcome(&state);

        let preview_url = self.preview_url(&sandbox_id).await?;

        let (content, files) = match message_type {
            MessageType::Error => (GENERIC_FAILURE.to_string(), FileMap::new()),
            _ => (generated.response, state.files),
        };
        let fragment = Fragment {
            title: generated.title,
            preview_url,
            files,
        };
        let message = self
            .persist(
                request,
                NewMessage::assistant(&request.project_id, message_type, content)
                    .with_fragment(fragment),
            )
            .await?;

        Ok(JobOutcome {
            message_id: message.id,
            message_type: message.message_type,
            content: message.content,
            fragment: message.fragment,
            summary: Some(report.summary),
        })
    }

    /// Reconnect to the sandbox and resolve its public preview URL
    async fn preview_url(&self, sandbox_id: &str) -> Result<String> {
        let sandboxes = &self.sandboxes;
        let port = self.config.sandbox.preview_port;
        self.invoker
            .run("get-sandbox", move || async move {
                let sandbox = sandboxes.acquire(sandbox_id).await?;
                let host = sandbox.host_for(port).await?;
                Ok::<_, KilnError>(format!("https://{}", host))
            })
            .await
    }

    async fn run_qa_job(&self, request: &JobRequest) -> Result<JobOutcome> {
        let history = self
            .store
            .messages_for_project(&request.project_id)
            .await?;
        let transcript = render_transcript(&history, &request.user_input);

        let llm_request = LlmRequest::new(
            QA_PROMPT,
            vec![ChatMessage::user(transcript)],
            ModelParams::from(&self.config.qa),
        );
        let response = self
            .invoker
            .run("qa-agent-run", || self.llm.invoke(&llm_request))
            .await?;
        let answer = extract_text(&response, QA_DEFAULT_RESPONSE);

        self.persist_reply(request, answer).await
    }

    async fn run_search_job(&self, request: &JobRequest) -> Result<JobOutcome> {
        let history = self
            .store
            .messages_for_project(&request.project_id)
            .await?;
        let prompt = build_search_prompt(&history, &request.user_input);

        let answer = match self.search.run_task(&prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Search agent failed: {}", e);
                SEARCH_APOLOGY.to_string()
            }
        };

        self.persist_reply(request, answer).await
    }

    async fn persist_reply(&self, request: &JobRequest, answer: String) -> Result<JobOutcome> {
        let message = self
            .persist(
                request,
                NewMessage::assistant(&request.project_id, MessageType::Assistant, answer),
            )
            .await?;
        Ok(JobOutcome {
            message_id: message.id,
            message_type: message.message_type,
            content: message.content,
            fragment: None,
            summary: None,
        })
    }

    /// Update the prior message when one is named, otherwise create one
    ///
    /// A prior message that no longer exists is replaced by a new one.
    async fn persist(&self, request: &JobRequest, message: NewMessage) -> Result<Message> {
        let Some(id) = &request.prior_message_id else {
            return self.store.create_message(message).await;
        };

        match self.store.update_message(id, message.clone().into()).await {
            Err(KilnError::MessageNotFound(missing)) => {
                warn!("Prior message {} is gone, creating a new one", missing);
                self.store.create_message(message).await
            }
            result => result,
        }
    }
}
