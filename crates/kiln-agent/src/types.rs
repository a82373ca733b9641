//! Type definitions for Kiln LLM interactions

use kiln_core::{AgentSettings, ModelSettings};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
            ChatRole::Tool => write!(f, "tool"),
        }
    }
}

/// Message content: a plain string or an ordered sequence of text parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<String>),
}

impl ChatContent {
    /// Content as one string, parts concatenated in order
    pub fn joined(&self) -> String {
        match self {
            ChatContent::Text(text) => text.clone(),
            ChatContent::Parts(parts) => parts.concat(),
        }
    }
}

impl From<&str> for ChatContent {
    fn from(s: &str) -> Self {
        ChatContent::Text(s.to_string())
    }
}

impl From<String> for ChatContent {
    fn from(s: String) -> Self {
        ChatContent::Text(s)
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

/// One message in a conversation, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<ChatContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool results; links back to the originating call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_content(role: ChatRole, content: impl Into<ChatContent>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<ChatContent>) -> Self {
        Self::with_content(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<ChatContent>) -> Self {
        Self::with_content(ChatRole::Assistant, content)
    }

    /// Assistant message that only requests tool calls
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: None,
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// Result of a tool call, fed back to the model
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<ChatContent>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Textual content, parts concatenated; `None` for tool-call-only messages
    pub fn text(&self) -> Option<String> {
        self.content.as_ref().map(ChatContent::joined)
    }

    /// Whether this is an assistant message carrying text
    pub fn is_assistant_text(&self) -> bool {
        self.role == ChatRole::Assistant && self.content.is_some()
    }
}

/// Model and sampling parameters for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
}

impl From<&ModelSettings> for ModelParams {
    fn from(settings: &ModelSettings) -> Self {
        Self {
            model: settings.model.clone(),
            temperature: settings.temperature,
        }
    }
}

impl From<&AgentSettings> for ModelParams {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            model: settings.model.clone(),
            temperature: settings.temperature,
        }
    }
}

/// Everything needed for one LLM invocation
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub params: ModelParams,
    pub tools: Vec<ToolDefinition>,
}

impl LlmRequest {
    pub fn new(
        system_prompt: impl Into<String>,
        messages: Vec<ChatMessage>,
        params: ModelParams,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            params,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Output of one LLM invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub output: Vec<ChatMessage>,
    pub usage: Option<Usage>,
}

impl LlmResponse {
    /// Response carrying a single assistant text message
    pub fn text(content: impl Into<ChatContent>) -> Self {
        Self {
            output: vec![ChatMessage::assistant(content)],
            usage: None,
        }
    }

    /// Response requesting tool calls only
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            output: vec![ChatMessage::tool_calls(calls)],
            usage: None,
        }
    }

    /// Text of the first output message, if that message is textual
    pub fn first_text(&self) -> Option<String> {
        self.output.first().and_then(ChatMessage::text)
    }
}

// OpenAI-compatible wire format

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<WireTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireFunctionCall {
    pub name: String,
    /// JSON-encoded arguments object
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: WireFunctionDef,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct WireFunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireResponse {
    pub choices: Vec<WireChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireChoice {
    pub message: WireMessage,
}

fn function_type() -> String {
    "function".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_parts_concatenate() {
        let content = ChatContent::Parts(vec!["Landing ".into(), "page".into()]);
        assert_eq!(content.joined(), "Landing page");
    }

    #[test]
    fn test_content_untagged_serde() {
        let text: ChatContent = serde_json::from_str(r#""hi""#).unwrap();
        assert_eq!(text, ChatContent::Text("hi".into()));

        let parts: ChatContent = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(parts.joined(), "ab");
    }

    #[test]
    fn test_first_text_skips_non_text() {
        let response = LlmResponse::tool_calls(vec![ToolCall {
            id: "call_1".into(),
            name: "terminal".into(),
            arguments: serde_json::json!({"command": "ls"}),
        }]);
        assert!(response.first_text().is_none());
        assert_eq!(response.output[0].tool_calls.len(), 1);
    }

    #[test]
    fn test_first_text_takes_first_assistant_message() {
        let response = LlmResponse {
            output: vec![
                ChatMessage::assistant("first"),
                ChatMessage::tool_result("call_1", "{}"),
                ChatMessage::assistant(ChatContent::Parts(vec!["se".into(), "cond".into()])),
            ],
            usage: None,
        };
        assert_eq!(response.first_text().as_deref(), Some("first"));
        assert_eq!(response.output[2].text().as_deref(), Some("second"));
    }

    #[test]
    fn test_model_params_from_settings() {
        let params = ModelParams::from(&AgentSettings::default());
        assert_eq!(params.model, "gpt-4.1");

        let params = ModelParams::from(&ModelSettings::default());
        assert_eq!(params.model, "gpt-4o");
    }
}
