//! HTTP client for the sandbox platform REST API
//!
//! Endpoints:
//! - `POST /sandboxes` create from template
//! - `GET /sandboxes/{id}` connect
//! - `POST /sandboxes/{id}/timeout` set idle timeout
//! - `POST /sandboxes/{id}/commands` run a command, NDJSON output stream
//! - `GET|PUT /sandboxes/{id}/files?path=` read/write a file

use async_trait::async_trait;
use futures::StreamExt;
use kiln_core::{KilnConfig, KilnError, ProviderError, Result, SandboxSettings};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::provider::{CommandOutput, OutputCallback, SandboxHandle, SandboxProvider};

#[derive(Debug, Clone)]
struct Endpoint {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    domain: String,
}

impl Endpoint {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("X-API-Key", &self.api_key)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| KilnError::Sandbox(format!("Request failed: {}", e)))?;
        check_status(response).await
    }

    async fn set_timeout(&self, id: &str, timeout: Duration) -> Result<()> {
        let builder = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{}/timeout", id))
            .json(&json!({ "timeout_secs": timeout.as_secs() }));
        self.send(builder).await?;
        Ok(())
    }
}

/// Turn a non-2xx response into a provider error
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown".to_string());

    warn!("Sandbox API error {}: {}", status, body);
    Err(ProviderError::from_http(status.as_u16(), retry_after.as_deref(), &body).into())
}

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    #[serde(alias = "sandboxId")]
    id: String,
}

/// One line of the command output stream
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CommandEvent {
    Stdout(String),
    Stderr(String),
    ExitCode(i32),
    Error(String),
}

/// Sandbox provider speaking the platform's REST API
#[derive(Debug, Clone)]
pub struct HttpSandboxProvider {
    endpoint: Endpoint,
    idle_timeout: Duration,
}

impl HttpSandboxProvider {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let settings = SandboxSettings::default();
        Self {
            endpoint: Endpoint {
                http: reqwest::Client::new(),
                api_url: api_url.into().trim_end_matches('/').to_string(),
                api_key: api_key.into(),
                domain: settings.domain,
            },
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
        }
    }

    /// Build from settings, reading the API key from the configured environment variable
    pub fn from_settings(settings: &SandboxSettings) -> Result<Self> {
        let api_key = KilnConfig::api_key(&settings.api_key_env)?;
        Ok(Self::new(&settings.api_url, api_key)
            .with_domain(&settings.domain)
            .with_idle_timeout(Duration::from_secs(settings.idle_timeout_secs)))
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.endpoint.domain = domain.into();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn handle(&self, id: String) -> Arc<dyn SandboxHandle> {
        Arc::new(HttpSandbox {
            id,
            endpoint: self.endpoint.clone(),
        })
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    #[instrument(skip(self))]
    async fn create(&self, template: &str) -> Result<Arc<dyn SandboxHandle>> {
        let builder = self
            .endpoint
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&json!({
                "template": template,
                "timeout_secs": self.idle_timeout.as_secs(),
            }));
        let info: SandboxInfo = self
            .endpoint
            .send(builder)
            .await?
            .json()
            .await
            .map_err(|e| KilnError::Sandbox(format!("Invalid create response: {}", e)))?;

        self.endpoint.set_timeout(&info.id, self.idle_timeout).await?;
        debug!("Created sandbox {}", info.id);
        Ok(self.handle(info.id))
    }

    #[instrument(skip(self))]
    async fn acquire(&self, id: &str) -> Result<Arc<dyn SandboxHandle>> {
        let builder = self
            .endpoint
            .request(reqwest::Method::GET, &format!("/sandboxes/{}", id));
        self.endpoint.send(builder).await?;

        self.endpoint.set_timeout(id, self.idle_timeout).await?;
        Ok(self.handle(id.to_string()))
    }
}

/// Handle to one remote sandbox
#[derive(Debug, Clone)]
pub struct HttpSandbox {
    id: String,
    endpoint: Endpoint,
}

#[async_trait]
impl SandboxHandle for HttpSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self, on_stdout, on_stderr), fields(sandbox = %self.id))]
    async fn run_command(
        &self,
        command: &str,
        on_stdout: OutputCallback<'_>,
        on_stderr: OutputCallback<'_>,
    ) -> Result<CommandOutput> {
        let builder = self
            .endpoint
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/commands", self.id),
            )
            .json(&json!({ "cmd": command }));
        let response = self.endpoint.send(builder).await?;

        let mut output = CommandOutput::default();
        let mut exit_code = None;
        let mut pending: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| KilnError::Sandbox(format!("Command stream failed: {}", e)))?;
            pending.extend_from_slice(&chunk);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if let Some(event) = parse_event(&line)? {
                    apply_event(event, &mut output, &mut exit_code, on_stdout, on_stderr)?;
                }
            }
        }
        if let Some(event) = parse_event(&pending)? {
            apply_event(event, &mut output, &mut exit_code, on_stdout, on_stderr)?;
        }

        output.exit_code = exit_code.unwrap_or(0);
        if !output.success() {
            debug!("Command exited with {}", output.exit_code);
            return Err(KilnError::CommandExit {
                exit_code: output.exit_code,
            });
        }
        Ok(output)
    }

    #[instrument(skip(self, content), fields(sandbox = %self.id))]
    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let builder = self
            .endpoint
            .request(reqwest::Method::PUT, &format!("/sandboxes/{}/files", self.id))
            .query(&[("path", path)])
            .body(content.to_string());
        self.endpoint.send(builder).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(sandbox = %self.id))]
    async fn read_file(&self, path: &str) -> Result<String> {
        let builder = self
            .endpoint
            .request(reqwest::Method::GET, &format!("/sandboxes/{}/files", self.id))
            .query(&[("path", path)]);
        self.endpoint
            .send(builder)
            .await?
            .text()
            .await
            .map_err(|e| KilnError::Sandbox(format!("Failed to read {}: {}", path, e)))
    }

    async fn host_for(&self, port: u16) -> Result<String> {
        Ok(format!("{}-{}.{}", port, self.id, self.endpoint.domain))
    }
}

fn parse_event(line: &[u8]) -> Result<Option<CommandEvent>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| KilnError::Sandbox(format!("Malformed command event {:?}: {}", text, e)))
}

fn apply_event(
    event: CommandEvent,
    output: &mut CommandOutput,
    exit_code: &mut Option<i32>,
    on_stdout: &mut (dyn FnMut(&str) + Send),
    on_stderr: &mut (dyn FnMut(&str) + Send),
) -> Result<()> {
    match event {
        CommandEvent::Stdout(data) => {
            on_stdout(&data);
            output.stdout.push_str(&data);
        }
        CommandEvent::Stderr(data) => {
            on_stderr(&data);
            output.stderr.push_str(&data);
        }
        CommandEvent::ExitCode(code) => *exit_code = Some(code),
        CommandEvent::Error(message) => return Err(KilnError::Sandbox(message)),
    }
    Ok(())
}
