//! Configuration management for Kiln
//!
//! Loaded from `.kiln/config.toml` under the data directory. Every field has a
//! serde default so partial files are valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{KilnError, Result};

/// Top-level Kiln configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Retry/backoff policy for provider calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Coding agent settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Title/response generation settings
    #[serde(default)]
    pub post_process: ModelSettings,

    /// Q&A agent settings
    #[serde(default = "default_qa_settings")]
    pub qa: ModelSettings,

    /// LLM provider endpoint
    #[serde(default)]
    pub llm: LlmSettings,

    /// Sandbox platform endpoint
    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// Deep-search agent endpoint
    #[serde(default)]
    pub search: SearchSettings,
}

/// Retry policy for the throttled invoker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry cap for payload-too-large errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base wait in milliseconds
    #[serde(default = "default_initial_wait_ms")]
    pub initial_wait_ms: u64,

    /// Keep retrying rate-limit class errors forever
    #[serde(default = "default_true")]
    pub infinite_rate_limit: bool,

    /// Upper bound (seconds) for a single rate-limit wait, before jitter
    #[serde(default = "default_max_rate_limit_wait")]
    pub max_rate_limit_wait_secs: f64,

    /// Cap on the consecutive-rate-limit backoff multiplier
    #[serde(default = "default_exponential_backoff_cap")]
    pub exponential_backoff_cap: u32,
}

/// Coding agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_model")]
    pub model: String,

    #[serde(default = "default_low_temperature")]
    pub temperature: f32,

    /// Turn cap per router pass
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Run the restated "write the following snippet" pass after the first
    #[serde(default = "default_true")]
    pub artifact_pass: bool,
}

/// Model and sampling parameters for a single-turn generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_generator_model")]
    pub model: String,

    #[serde(default = "default_low_temperature")]
    pub temperature: f32,
}

/// LLM provider endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
}

/// Sandbox platform endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_sandbox_api_url")]
    pub api_url: String,

    /// Environment variable holding the API key
    #[serde(default = "default_sandbox_api_key_env")]
    pub api_key_env: String,

    /// Template new sandboxes are created from
    #[serde(default = "default_sandbox_template")]
    pub template: String,

    /// Idle timeout applied on every acquisition
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Port the generated app is served on
    #[serde(default = "default_preview_port")]
    pub preview_port: u16,

    /// Public domain sandboxes are reachable under
    #[serde(default = "default_sandbox_domain")]
    pub domain: String,
}

/// Deep-search agent endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSettings {
    #[serde(default = "default_search_url")]
    pub url: String,
}

// Default value providers
fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_wait_ms() -> u64 {
    8000
}

fn default_max_rate_limit_wait() -> f64 {
    600.0
}

fn default_exponential_backoff_cap() -> u32 {
    10
}

fn default_agent_model() -> String {
    "gpt-4.1".to_string()
}

fn default_generator_model() -> String {
    "gpt-4o".to_string()
}

fn default_low_temperature() -> f32 {
    0.1
}

fn default_max_iterations() -> usize {
    15
}

fn default_qa_settings() -> ModelSettings {
    ModelSettings {
        model: default_generator_model(),
        temperature: 0.5,
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_sandbox_api_url() -> String {
    "https://api.e2b.dev".to_string()
}

fn default_sandbox_api_key_env() -> String {
    "E2B_API_KEY".to_string()
}

fn default_sandbox_template() -> String {
    "kiln-nextjs".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_preview_port() -> u16 {
    3000
}

fn default_sandbox_domain() -> String {
    "e2b.app".to_string()
}

fn default_search_url() -> String {
    "http://localhost:8000/run-task".to_string()
}

impl KilnConfig {
    /// Load configuration from `.kiln/config.toml` or use defaults
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(".kiln/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| KilnError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.kiln/config.toml`
    pub fn write_default(data_dir: &Path) -> Result<()> {
        let config_dir = data_dir.join(".kiln");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| KilnError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Read an API key from the environment variable named in config
    pub fn api_key(env_var: &str) -> Result<String> {
        std::env::var(env_var)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| KilnError::Config(format!("{} is not set", env_var)))
    }
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            agent: AgentSettings::default(),
            post_process: ModelSettings::default(),
            qa: default_qa_settings(),
            llm: LlmSettings::default(),
            sandbox: SandboxSettings::default(),
            search: SearchSettings::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_wait_ms: default_initial_wait_ms(),
            infinite_rate_limit: true,
            max_rate_limit_wait_secs: default_max_rate_limit_wait(),
            exponential_backoff_cap: default_exponential_backoff_cap(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: default_agent_model(),
            temperature: default_low_temperature(),
            max_iterations: default_max_iterations(),
            artifact_pass: true,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: default_generator_model(),
            temperature: default_low_temperature(),
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key_env: default_llm_api_key_env(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            api_url: default_sandbox_api_url(),
            api_key_env: default_sandbox_api_key_env(),
            template: default_sandbox_template(),
            idle_timeout_secs: default_idle_timeout_secs(),
            preview_port: default_preview_port(),
            domain: default_sandbox_domain(),
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            url: default_search_url(),
        }
    }
}
