//! Client for the external deep-search agent

use async_trait::async_trait;
use kiln_core::{KilnError, ProviderError, Result, SearchSettings};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, instrument};

/// Reply persisted when the search agent cannot answer
pub const SEARCH_APOLOGY: &str = "Sorry, the search agent failed to respond. Please try again.";

/// Trait for the deep-search backend (allows scripted agents in tests)
#[async_trait]
pub trait SearchAgent: Send + Sync {
    /// Run one task and return the agent's answer
    async fn run_task(&self, prompt: &str) -> Result<String>;
}

#[derive(Serialize)]
struct TaskRequest<'a> {
    task: &'a str,
}

#[derive(Deserialize)]
struct TaskResponse {
    result: String,
}

/// Search agent reached over HTTP: `POST {"task": ..}` returning `{"result": ..}`
pub struct HttpSearchAgent {
    client: reqwest::Client,
    url: String,
}

impl HttpSearchAgent {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self::new(settings.url.clone())
    }
}

#[async_trait]
impl SearchAgent for HttpSearchAgent {
    #[instrument(skip(self, prompt), fields(url = %self.url))]
    async fn run_task(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&TaskRequest { task: prompt })
            .send()
            .await
            .map_err(|e| KilnError::Api(format!("Search agent request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_http(status.as_u16(), None, &body).into());
        }

        let body: TaskResponse = response
            .json()
            .await
            .map_err(|e| KilnError::Api(format!("Invalid search agent response: {}", e)))?;
        debug!("Search agent answered with {} chars", body.result.len());
        Ok(body.result)
    }
}

/// Search agent returning a fixed answer (or failing) and recording prompts
pub struct StaticSearchAgent {
    answer: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl StaticSearchAgent {
    pub fn answering(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchAgent for StaticSearchAgent {
    async fn run_task(&self, prompt: &str) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.answer
            .clone()
            .ok_or_else(|| KilnError::Api("Search agent unavailable".to_string()))
    }
}
