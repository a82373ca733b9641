//! Core type definitions for Kiln job execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Map of slash-separated relative path to full file content
pub type FileMap = BTreeMap<String, String>;

/// Mutable state shared across one job execution
///
/// Created empty at job start, threaded by reference through every tool call
/// and router decision, read once at the end to build the final payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Converged natural-language result; empty until the router converges
    pub summary: String,
    /// Accumulated artifact (last write wins per path)
    pub files: FileMap,
    /// Contents returned by the most recent successful read
    pub read_files: FileMap,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the summary holds usable text
    pub fn has_summary(&self) -> bool {
        !self.summary.trim().is_empty()
    }

    /// Overlay written files onto the artifact; never removes existing paths
    pub fn merge_files<I>(&mut self, written: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.files.extend(written);
    }
}

/// Author of a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// Kind of persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Successful artifact (or a plain user prompt)
    Result,
    /// Failed job
    Error,
    /// Plain assistant reply without an artifact
    Assistant,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Result => write!(f, "RESULT"),
            Self::Error => write!(f, "ERROR"),
            Self::Assistant => write!(f, "ASSISTANT"),
        }
    }
}

/// Persisted artifact record linked to an assistant message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub title: String,
    pub preview_url: String,
    pub files: FileMap,
}

/// A message in a project's conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub content: String,
    pub fragment: Option<Fragment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Materialize a new message with a fresh id and timestamps
    pub fn from_new(new: NewMessage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: new.project_id,
            role: new.role,
            message_type: new.message_type,
            content: new.content,
            fragment: new.fragment,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an update in place
    pub fn apply(&mut self, update: MessageUpdate) {
        self.content = update.content;
        if let Some(message_type) = update.message_type {
            self.message_type = message_type;
        }
        if update.fragment.is_some() {
            self.fragment = update.fragment;
        }
        self.updated_at = Utc::now();
    }
}

/// Payload for creating a message
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub project_id: String,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub content: String,
    pub fragment: Option<Fragment>,
}

impl NewMessage {
    /// A user prompt as recorded by the product before a job is triggered
    pub fn user(project_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            role: MessageRole::User,
            message_type: MessageType::Result,
            content: content.into(),
            fragment: None,
        }
    }

    /// An assistant message
    pub fn assistant(
        project_id: impl Into<String>,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            role: MessageRole::Assistant,
            message_type,
            content: content.into(),
            fragment: None,
        }
    }

    pub fn with_fragment(mut self, fragment: Fragment) -> Self {
        self.fragment = Some(fragment);
        self
    }
}

/// Payload for updating a message by id
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    pub content: String,
    pub message_type: Option<MessageType>,
    pub fragment: Option<Fragment>,
}

impl From<NewMessage> for MessageUpdate {
    fn from(new: NewMessage) -> Self {
        Self {
            content: new.content,
            message_type: Some(new.message_type),
            fragment: new.fragment,
        }
    }
}

/// Supported task types, one trigger event each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Coding agent producing files and a preview
    Code,
    /// Single-turn Q&A assistant
    Qa,
    /// External deep-search agent
    Search,
}

impl TaskKind {
    /// Trigger event name for this task kind
    pub fn event_name(&self) -> &'static str {
        match self {
            TaskKind::Code => "code-agent/run",
            TaskKind::Qa => "qa-agent/run",
            TaskKind::Search => "search-agent/run",
        }
    }

    /// Resolve a trigger event name
    pub fn from_event_name(name: &str) -> Option<Self> {
        [TaskKind::Code, TaskKind::Qa, TaskKind::Search]
            .into_iter()
            .find(|kind| kind.event_name() == name)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Code => write!(f, "code"),
            TaskKind::Qa => write!(f, "qa"),
            TaskKind::Search => write!(f, "search"),
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "code" => Ok(TaskKind::Code),
            "qa" => Ok(TaskKind::Qa),
            "search" => Ok(TaskKind::Search),
            _ => Err(format!("Invalid task kind: {}. Use code, qa, or search.", s)),
        }
    }
}

/// Payload carried by every trigger event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub project_id: String,
    /// The new user input
    #[serde(rename = "value")]
    pub user_input: String,
    /// Existing message to update instead of creating a new one
    #[serde(default, rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub prior_message_id: Option<String>,
}

impl JobRequest {
    pub fn new(project_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_input: user_input.into(),
            prior_message_id: None,
        }
    }

    pub fn with_prior_message(mut self, id: impl Into<String>) -> Self {
        self.prior_message_id = Some(id.into());
        self
    }
}

/// Serialized trigger event: `{"name": "code-agent/run", "data": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub name: String,
    pub data: JobRequest,
}

impl JobEvent {
    pub fn new(kind: TaskKind, data: JobRequest) -> Self {
        Self {
            name: kind.event_name().to_string(),
            data,
        }
    }

    /// Task kind addressed by this event, if supported
    pub fn kind(&self) -> Option<TaskKind> {
        TaskKind::from_event_name(&self.name)
    }
}

/// What a job persisted and returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub message_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub fragment: Option<Fragment>,
    /// Converged agent summary (coding jobs only)
    pub summary: Option<String>,
}
