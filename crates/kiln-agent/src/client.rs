//! LLM client abstraction and the OpenAI-compatible HTTP implementation
//!
//! Clients make exactly one HTTP attempt per call. Throttling is surfaced as
//! `KilnError::Provider` and recovered by the throttled invoker, never here.

use async_trait::async_trait;
use kiln_core::{KilnConfig, KilnError, LlmSettings, ProviderError, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::{
    ChatContent, ChatMessage, ChatRole, LlmRequest, LlmResponse, ToolCall, WireFunctionCall,
    WireFunctionDef, WireMessage, WireRequest, WireResponse, WireTool, WireToolCall,
};

/// Trait for invoking an LLM (allows scripting in tests)
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion over the system prompt and conversation
    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse>;
}

/// Client for OpenAI-compatible chat completion APIs
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Build from settings, reading the API key from the configured environment variable
    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let api_key = KilnConfig::api_key(&settings.api_key_env)?;
        Ok(Self::new(&settings.base_url, api_key))
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = to_wire(request);

        tracing::debug!(
            "Sending chat completion ({} messages, {} tools) to {}",
            body.messages.len(),
            body.tools.len(),
            request.params.model
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| KilnError::Api(format!("Failed to send request: {}", e)))?;

        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());

            tracing::warn!("LLM API error {}: {}", status, error_text);
            return Err(ProviderError::from_http(
                status.as_u16(),
                retry_after.as_deref(),
                &error_text,
            )
            .into());
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| KilnError::Api(format!("Failed to parse response: {}", e)))?;

        let parsed = from_wire(wire)?;

        if let Some(ref usage) = parsed.usage {
            tracing::info!(
                "Completion done ({} prompt tokens, {} completion tokens)",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        Ok(parsed)
    }
}

fn to_wire(request: &LlmRequest) -> WireRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    messages.push(WireMessage {
        role: ChatRole::System.to_string(),
        content: Some(Value::String(request.system_prompt.clone())),
        tool_calls: None,
        tool_call_id: None,
    });

    for message in &request.messages {
        let tool_calls = (!message.tool_calls.is_empty()).then(|| {
            message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect()
        });

        messages.push(WireMessage {
            role: message.role.to_string(),
            content: message.text().map(Value::String),
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        });
    }

    let tools = request
        .tools
        .iter()
        .map(|tool| WireTool {
            tool_type: "function".to_string(),
            function: WireFunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        })
        .collect();

    WireRequest {
        model: request.params.model.clone(),
        temperature: request.params.temperature,
        messages,
        tools,
    }
}

fn from_wire(wire: WireResponse) -> Result<LlmResponse> {
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| KilnError::Api("No choices in response".to_string()))?;

    let message = choice.message;
    let mut output = Vec::new();

    if let Some(content) = message.content.and_then(content_from_value) {
        output.push(ChatMessage::assistant(content));
    }

    if let Some(calls) = message.tool_calls {
        let calls = calls
            .into_iter()
            .map(|call| {
                // Malformed argument JSON is handed to the tool as a raw string so the
                // tool can report it back to the model
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments));
                ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect::<Vec<_>>();
        if !calls.is_empty() {
            output.push(ChatMessage::tool_calls(calls));
        }
    }

    Ok(LlmResponse {
        output,
        usage: wire.usage,
    })
}

fn content_from_value(value: Value) -> Option<ChatContent> {
    match value {
        Value::String(text) => Some(ChatContent::Text(text)),
        Value::Array(parts) => {
            let parts: Vec<String> = parts
                .into_iter()
                .filter_map(|part| match part {
                    Value::String(text) => Some(text),
                    Value::Object(obj) => obj
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(String::from),
                    _ => None,
                })
                .collect();
            Some(ChatContent::Parts(parts))
        }
        _ => None,
    }
}

/// A scripted reply for `ScriptedLlmClient`
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond(LlmResponse),
    Fail(ProviderError),
}

impl From<LlmResponse> for ScriptedReply {
    fn from(response: LlmResponse) -> Self {
        ScriptedReply::Respond(response)
    }
}

impl From<ProviderError> for ScriptedReply {
    fn from(err: ProviderError) -> Self {
        ScriptedReply::Fail(err)
    }
}

#[derive(Default)]
struct Script {
    queue: VecDeque<ScriptedReply>,
    by_system_prompt: HashMap<String, VecDeque<ScriptedReply>>,
    fallback: Option<ScriptedReply>,
    requests: Vec<LlmRequest>,
}

/// LLM client replaying canned replies, for testing
///
/// Replies are routed by exact system prompt first, then taken from the shared
/// queue, then from the fallback reply. Every request is recorded.
#[derive(Default)]
pub struct ScriptedLlmClient {
    script: Mutex<Script>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for any system prompt
    pub fn with_reply(self, reply: impl Into<ScriptedReply>) -> Self {
        self.lock().queue.push_back(reply.into());
        self
    }

    /// Queue a reply for requests using exactly this system prompt
    pub fn with_reply_for(self, system_prompt: &str, reply: impl Into<ScriptedReply>) -> Self {
        self.lock()
            .by_system_prompt
            .entry(system_prompt.to_string())
            .or_default()
            .push_back(reply.into());
        self
    }

    /// Reply used once the queues are drained
    pub fn with_fallback(self, reply: impl Into<ScriptedReply>) -> Self {
        self.lock().fallback = Some(reply.into());
        self
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.lock().requests.clone()
    }

    /// Requests received so far with this system prompt
    pub fn requests_for(&self, system_prompt: &str) -> Vec<LlmRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.system_prompt == system_prompt)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        // A poisoned script only means another test thread panicked mid-push
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let reply = {
            let mut script = self.lock();
            script.requests.push(request.clone());

            let routed = script
                .by_system_prompt
                .get_mut(&request.system_prompt)
                .and_then(VecDeque::pop_front);

            routed
                .or_else(|| script.queue.pop_front())
                .or_else(|| script.fallback.clone())
        };

        match reply {
            Some(ScriptedReply::Respond(response)) => Ok(response),
            Some(ScriptedReply::Fail(err)) => Err(err.into()),
            None => Err(KilnError::Api("Scripted LLM has no reply left".to_string())),
        }
    }
}
