//! End-to-end job tests.
//!
//! These run whole jobs against the scripted LLM, the in-memory sandbox
//! provider and the in-memory conversation store.

use kiln_agent::{LlmResponse, ScriptedLlmClient, ThrottledInvoker, ToolCall};
use kiln_core::{
    JobEvent, JobRequest, KilnConfig, KilnError, MessageType, NewMessage, ProviderError,
    RetryConfig, TaskKind,
};
use kiln_orchestrator::{
    ConversationStore, InMemoryConversationStore, JobRunner, StaticSearchAgent,
    CODE_AGENT_PROMPT, GENERIC_FAILURE, QA_PROMPT, RESPONSE_PROMPT, SEARCH_APOLOGY,
    SEARCH_SYSTEM_LINE, TITLE_PROMPT,
};
use kiln_sandbox::{InMemorySandbox, InMemorySandboxProvider};
use serde_json::json;
use std::sync::Arc;

struct Harness {
    runner: JobRunner,
    llm: Arc<ScriptedLlmClient>,
    sandboxes: Arc<InMemorySandboxProvider>,
    store: Arc<InMemoryConversationStore>,
    search: Arc<StaticSearchAgent>,
}

fn fast_invoker() -> ThrottledInvoker {
    ThrottledInvoker::new(RetryConfig {
        initial_wait_ms: 1,
        max_rate_limit_wait_secs: 0.005,
        ..RetryConfig::default()
    })
}

fn harness_with(
    config: KilnConfig,
    llm: ScriptedLlmClient,
    sandboxes: InMemorySandboxProvider,
    search: StaticSearchAgent,
) -> Harness {
    let llm = Arc::new(llm);
    let sandboxes = Arc::new(sandboxes);
    let store = Arc::new(InMemoryConversationStore::new());
    let search = Arc::new(search);
    let runner = JobRunner::new(
        config,
        llm.clone(),
        sandboxes.clone(),
        store.clone(),
        search.clone(),
    )
    .with_invoker(fast_invoker());
    Harness {
        runner,
        llm,
        sandboxes,
        store,
        search,
    }
}

fn harness(llm: ScriptedLlmClient) -> Harness {
    harness_with(
        KilnConfig::default(),
        llm,
        InMemorySandboxProvider::new(),
        StaticSearchAgent::answering("unused"),
    )
}

fn write_readme() -> LlmResponse {
    LlmResponse::tool_calls(vec![ToolCall {
        id: "call_1".into(),
        name: "createOrUpdateFiles".into(),
        arguments: json!({"files": [{"path": "README.md", "content": "hello"}]}),
    }])
}

/// Agent that writes README.md, converges, then confirms in the artifact pass
fn readme_agent() -> ScriptedLlmClient {
    ScriptedLlmClient::new()
        .with_reply_for(CODE_AGENT_PROMPT, write_readme())
        .with_reply_for(CODE_AGENT_PROMPT, LlmResponse::text("Created README.md"))
        .with_reply_for(CODE_AGENT_PROMPT, LlmResponse::text("README is in place"))
        .with_reply_for(TITLE_PROMPT, LlmResponse::text("Readme File"))
        .with_reply_for(RESPONSE_PROMPT, LlmResponse::text("I added a README."))
}

#[tokio::test]
async fn test_code_job_persists_result_with_fragment() {
    let h = harness(readme_agent());

    let outcome = h
        .runner
        .run(TaskKind::Code, JobRequest::new("p1", "add a README"))
        .await
        .unwrap();

    assert_eq!(outcome.message_type, MessageType::Result);
    assert_eq!(outcome.content, "I added a README.");
    assert_eq!(outcome.summary.as_deref(), Some("README is in place"));

    let fragment = outcome.fragment.expect("result carries a fragment");
    assert_eq!(fragment.title, "Readme File");
    assert_eq!(fragment.preview_url, "https://3000-kiln-nextjs-1.sandbox.test");
    assert_eq!(fragment.files.len(), 1);
    assert_eq!(fragment.files["README.md"], "hello");

    // the file really landed in the sandbox
    let sandbox = h.sandboxes.sandbox("kiln-nextjs-1").unwrap();
    assert_eq!(sandbox.file("README.md").as_deref(), Some("hello"));
    assert_eq!(h.sandboxes.created(), 1);
    // idle timeout set at creation, on the tool call, and at preview lookup
    assert_eq!(sandbox.timeout_resets(), 3);

    let messages = h.store.all().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, outcome.message_id);
    assert_eq!(messages[0].message_type, MessageType::Result);

    // post-processing sees the artifact pass summary
    let title_requests = h.llm.requests_for(TITLE_PROMPT);
    assert_eq!(
        title_requests[0].messages[0].text().as_deref(),
        Some("README is in place")
    );
}

#[tokio::test]
async fn test_code_job_without_files_is_error() {
    let llm = ScriptedLlmClient::new()
        .with_reply_for(CODE_AGENT_PROMPT, LlmResponse::text("I would write a README"))
        .with_reply_for(CODE_AGENT_PROMPT, LlmResponse::text("Still only a plan"))
        .with_reply_for(TITLE_PROMPT, LlmResponse::text("Readme Plan"))
        .with_reply_for(RESPONSE_PROMPT, LlmResponse::text("Here is a plan."));
    let h = harness(llm);

    let outcome = h
        .runner
        .run(TaskKind::Code, JobRequest::new("p1", "add a README"))
        .await
        .unwrap();

    assert_eq!(outcome.message_type, MessageType::Error);
    assert_eq!(outcome.content, GENERIC_FAILURE);
    let fragment = outcome.fragment.unwrap();
    assert!(fragment.files.is_empty());
    assert_eq!(fragment.title, "Readme Plan");
    assert!(fragment.preview_url.starts_with("https://3000-"));
}

#[tokio::test]
async fn test_code_job_updates_prior_message() {
    let h = harness(readme_agent());
    let placeholder = h
        .store
        .create_message(NewMessage::assistant("p1", MessageType::Assistant, "Working..."))
        .await
        .unwrap();

    let outcome = h
        .runner
        .run(
            TaskKind::Code,
            JobRequest::new("p1", "add a README").with_prior_message(&placeholder.id),
        )
        .await
        .unwrap();

    assert_eq!(outcome.message_id, placeholder.id);
    let messages = h.store.all().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "I added a README.");
    assert_eq!(messages[0].message_type, MessageType::Result);
    assert!(messages[0].fragment.is_some());
}

#[tokio::test]
async fn test_code_job_seeds_conversation_with_history() {
    let h = harness(readme_agent());
    h.store
        .create_message(NewMessage::user("p1", "build a landing page"))
        .await
        .unwrap();
    h.store
        .create_message(NewMessage::assistant("p1", MessageType::Result, "Done."))
        .await
        .unwrap();

    h.runner
        .run(TaskKind::Code, JobRequest::new("p1", "add a README"))
        .await
        .unwrap();

    let first = &h.llm.requests_for(CODE_AGENT_PROMPT)[0];
    let texts: Vec<_> = first.messages.iter().filter_map(|m| m.text()).collect();
    assert_eq!(texts, vec!["build a landing page", "Done.", "add a README"]);
}

#[tokio::test]
async fn test_sandbox_creation_retried_under_rate_limit() {
    let h = harness_with(
        KilnConfig::default(),
        readme_agent(),
        InMemorySandboxProvider::new()
            .with_create_failure(ProviderError::new("Too many requests").with_status(429)),
        StaticSearchAgent::answering("unused"),
    );

    let outcome = h
        .runner
        .run(TaskKind::Code, JobRequest::new("p1", "add a README"))
        .await
        .unwrap();

    assert_eq!(outcome.message_type, MessageType::Result);
    assert_eq!(h.sandboxes.created(), 1);
}

#[tokio::test]
async fn test_preview_lookup_retried_while_sandbox_starts() {
    let h = harness_with(
        KilnConfig::default(),
        readme_agent(),
        InMemorySandboxProvider::new().with_sandbox(
            InMemorySandbox::new("sb-preview")
                .with_host_failure(ProviderError::new("port not open yet").with_status(429)),
        ),
        StaticSearchAgent::answering("unused"),
    );

    let outcome = h
        .runner
        .run(TaskKind::Code, JobRequest::new("p1", "add a README"))
        .await
        .unwrap();

    assert_eq!(outcome.message_type, MessageType::Result);
    assert_eq!(
        outcome.fragment.unwrap().preview_url,
        "https://3000-sb-preview.sandbox.test"
    );
    // create, one tool call, then two preview attempts
    let sandbox = h.sandboxes.sandbox("sb-preview").unwrap();
    assert_eq!(sandbox.timeout_resets(), 4);
}

#[tokio::test]
async fn test_missing_prior_message_gets_replaced() {
    let h = harness(readme_agent());

    let outcome = h
        .runner
        .run(
            TaskKind::Code,
            JobRequest::new("p1", "add a README").with_prior_message("deleted-placeholder"),
        )
        .await
        .unwrap();

    assert_ne!(outcome.message_id, "deleted-placeholder");
    let messages = h.store.all().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, outcome.message_id);
    assert_eq!(messages[0].message_type, MessageType::Result);
}

#[tokio::test]
async fn test_failure_record_lands_when_prior_message_is_missing() {
    let llm = ScriptedLlmClient::new().with_fallback(ProviderError::new("internal").with_status(500));
    let h = harness(llm);

    let err = h
        .runner
        .run(
            TaskKind::Code,
            JobRequest::new("p1", "add a README").with_prior_message("deleted-placeholder"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::Provider(_)));

    let messages = h.store.all().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Error);
    assert_eq!(messages[0].content, GENERIC_FAILURE);
}

#[tokio::test]
async fn test_failed_job_leaves_failure_record() {
    let llm = ScriptedLlmClient::new().with_fallback(ProviderError::new("internal").with_status(500));
    let h = harness(llm);

    let err = h
        .runner
        .run(TaskKind::Code, JobRequest::new("p1", "add a README"))
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::Provider(_)));

    let messages = h.store.all().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Error);
    assert_eq!(messages[0].content, GENERIC_FAILURE);
    assert!(messages[0].fragment.is_none());
}

#[tokio::test]
async fn test_silent_agent_fails_convergence() {
    let mut config = KilnConfig::default();
    config.agent.max_iterations = 3;
    config.agent.artifact_pass = false;
    let h = harness_with(
        config,
        ScriptedLlmClient::new().with_fallback(LlmResponse::text("")),
        InMemorySandboxProvider::new(),
        StaticSearchAgent::answering("unused"),
    );

    let err = h
        .runner
        .run(TaskKind::Code, JobRequest::new("p1", "add a README"))
        .await
        .unwrap_err();

    assert!(matches!(err, KilnError::Convergence(_)));
    assert_eq!(h.llm.requests_for(CODE_AGENT_PROMPT).len(), 3);
    assert_eq!(h.store.all().await[0].content, GENERIC_FAILURE);
}

#[tokio::test]
async fn test_qa_job_answers_from_transcript() {
    let llm = ScriptedLlmClient::new().with_reply_for(QA_PROMPT, LlmResponse::text("Use useState."));
    let h = harness(llm);
    h.store
        .create_message(NewMessage::user("p1", "build a todo app"))
        .await
        .unwrap();

    let outcome = h
        .runner
        .run(TaskKind::Qa, JobRequest::new("p1", "how do I add state?"))
        .await
        .unwrap();

    assert_eq!(outcome.message_type, MessageType::Assistant);
    assert_eq!(outcome.content, "Use useState.");
    assert!(outcome.fragment.is_none());

    let request = &h.llm.requests_for(QA_PROMPT)[0];
    assert_eq!(
        request.messages[0].text().as_deref(),
        Some("user: build a todo app\nuser: how do I add state?")
    );
    assert!((request.params.temperature - 0.5).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_qa_job_defaults_when_model_is_silent() {
    let h = harness(ScriptedLlmClient::new().with_reply_for(QA_PROMPT, LlmResponse::default()));

    let outcome = h
        .runner
        .run(TaskKind::Qa, JobRequest::new("p1", "hello"))
        .await
        .unwrap();
    assert_eq!(outcome.content, "Here you go.");
}

#[tokio::test]
async fn test_search_job_sends_prompt_and_persists_answer() {
    let h = harness_with(
        KilnConfig::default(),
        ScriptedLlmClient::new(),
        InMemorySandboxProvider::new(),
        StaticSearchAgent::answering("Tokio is the most used runtime."),
    );

    let outcome = h
        .runner
        .handle_event(&JobEvent::new(
            TaskKind::Search,
            JobRequest::new("p1", "which async runtime?"),
        ))
        .await
        .unwrap();

    assert_eq!(outcome.message_type, MessageType::Assistant);
    assert_eq!(outcome.content, "Tokio is the most used runtime.");
    assert_eq!(
        h.search.prompts(),
        vec![format!("{}\nuser: which async runtime?", SEARCH_SYSTEM_LINE)]
    );
    assert!(h.llm.requests().is_empty());
}

#[tokio::test]
async fn test_search_job_apologizes_on_agent_failure() {
    let h = harness_with(
        KilnConfig::default(),
        ScriptedLlmClient::new(),
        InMemorySandboxProvider::new(),
        StaticSearchAgent::failing(),
    );

    let outcome = h
        .runner
        .run(TaskKind::Search, JobRequest::new("p1", "anything"))
        .await
        .unwrap();

    assert_eq!(outcome.content, SEARCH_APOLOGY);
    assert_eq!(h.store.all().await[0].message_type, MessageType::Assistant);
}

#[tokio::test]
async fn test_unknown_event_is_rejected() {
    let h = harness(ScriptedLlmClient::new());
    let event = JobEvent {
        name: "image-agent/run".into(),
        data: JobRequest::new("p1", "draw a cat"),
    };

    let err = h.runner.handle_event(&event).await.unwrap_err();
    assert!(matches!(err, KilnError::UnknownEvent(name) if name == "image-agent/run"));
    assert!(h.store.all().await.is_empty());
}
