//! Unified error types for Kiln

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error payload reported by an external provider (LLM API or sandbox platform)
///
/// Mirrors the `{"error": {"code", "type", "message"}}` body most providers return,
/// plus the HTTP status and any `Retry-After` header seen on the response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    /// HTTP status, when the error came from an HTTP response
    pub status: Option<u16>,
    /// Machine-readable error code (e.g. `rate_limit_exceeded`)
    pub code: Option<String>,
    /// Error category (e.g. `tokens` for token-bucket exhaustion)
    pub error_type: Option<String>,
    /// Free-text message
    pub message: String,
    /// Structured retry hint from the `Retry-After` header
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    /// Create a provider error carrying only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Build from the pieces of a failed HTTP response
    ///
    /// `body` is parsed as `{"error": {"code", "type", "message"}}` when possible,
    /// otherwise kept verbatim as the message. `retry_after` is the raw header value
    /// in (possibly fractional) seconds; a value that does not fit a `Duration` is dropped.
    pub fn from_http(status: u16, retry_after: Option<&str>, body: &str) -> Self {
        let mut err = Self::new(body.trim()).with_status(status);

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            let payload = value.get("error").unwrap_or(&value);
            let field = |name: &str| payload.get(name).and_then(|v| v.as_str()).map(String::from);

            if let Some(message) = field("message") {
                err.message = message;
            } else if let Some(message) = payload.as_str() {
                err.message = message.to_string();
            }
            err.code = field("code");
            err.error_type = field("type");
        }

        err.retry_after = retry_after
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        err
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, "{} ({}): {}", status, code, self.message),
            (Some(status), None) => write!(f, "{}: {}", status, self.message),
            (None, Some(code)) => write!(f, "{}: {}", code, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

/// Unified error type for all Kiln operations
#[derive(Error, Debug)]
pub enum KilnError {
    // Provider errors (classified by the throttled invoker)
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    #[error("[{label}] Payload too large after {retries} retries")]
    PayloadTooLarge { label: String, retries: u32 },

    // LLM errors
    #[error("API error: {0}")]
    Api(String),

    // Sandbox errors
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Command exited with code {exit_code}")]
    CommandExit { exit_code: i32 },

    // Agent errors
    #[error("Convergence failed: {0}")]
    Convergence(String),

    // Conversation store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ProviderError> for KilnError {
    fn from(e: ProviderError) -> Self {
        KilnError::Provider(e)
    }
}

impl KilnError {
    /// Provider payload, if this error came from a provider
    pub fn provider(&self) -> Option<&ProviderError> {
        match self {
            KilnError::Provider(p) => Some(p),
            _ => None,
        }
    }
}

/// Result type alias using KilnError
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new("slow down")
            .with_status(429)
            .with_code("rate_limit_exceeded");
        assert_eq!(err.to_string(), "429 (rate_limit_exceeded): slow down");

        let err = ProviderError::new("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_from_http_structured_body() {
        let body = r#"{"error":{"code":"rate_limit_exceeded","type":"requests","message":"Please try again in 1.5s"}}"#;
        let err = ProviderError::from_http(429, Some("2"), body);
        assert_eq!(err.status, Some(429));
        assert_eq!(err.code.as_deref(), Some("rate_limit_exceeded"));
        assert_eq!(err.error_type.as_deref(), Some("requests"));
        assert_eq!(err.message, "Please try again in 1.5s");
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_from_http_plain_body() {
        let err = ProviderError::from_http(502, Some("soon"), "bad gateway\n");
        assert_eq!(err.message, "bad gateway");
        assert!(err.code.is_none());
        assert!(err.retry_after.is_none());
    }

    #[test]
    fn test_provider_accessor() {
        let err: KilnError = ProviderError::new("x").with_type("tokens").into();
        assert_eq!(
            err.provider().and_then(|p| p.error_type.as_deref()),
            Some("tokens")
        );
        assert!(KilnError::Store("y".into()).provider().is_none());
    }

    #[test]
    fn test_from_http_drops_unrepresentable_retry_after() {
        for header in ["1e20", "-3", "NaN", "inf"] {
            let err = ProviderError::from_http(429, Some(header), "{}");
            assert_eq!(err.status, Some(429));
            assert!(err.retry_after.is_none(), "kept {:?}", header);
        }

        let err = ProviderError::from_http(429, Some("0.25"), "{}");
        assert_eq!(err.retry_after, Some(Duration::from_millis(250)));
    }
}
