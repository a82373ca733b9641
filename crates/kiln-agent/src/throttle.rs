//! Throttled invoker: retry/backoff around provider calls
//!
//! Wraps any fallible async operation. Provider errors are classified into
//! token limits, request-rate limits and oversized payloads, which are retried
//! with computed waits. Everything else propagates on the first attempt.
//!
//! Rate-limit classes retry indefinitely while `infinite_rate_limit` is set.
//! There is no wall-clock bound here; the job's host owns overall timeouts and
//! cancellation.

use async_trait::async_trait;
use kiln_core::{KilnError, ProviderError, Result, RetryConfig};
use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Maximum jitter added on top of a rate-limit wait, as a fraction of the wait
pub const RATE_LIMIT_JITTER: f64 = 0.2;

/// Ceiling for any single computed wait, in seconds
pub const MAX_WAIT_SECS: f64 = 3600.0;

/// How the invoker treats a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleClass {
    /// Token bucket exhausted (`type == "tokens"`)
    TokenLimit,
    /// Request-rate throttling (`rate_limit_exceeded` or HTTP 429)
    RateLimit,
    /// Request body over the provider's size limit
    PayloadTooLarge,
    /// Anything else; never retried
    Fatal,
}

/// Classify an error
///
/// Structured fields are checked first. The `Requested ... Limit` substring
/// match on the free-text message is a last resort for providers that report
/// oversized payloads without a code.
pub fn classify(err: &KilnError) -> ThrottleClass {
    let Some(provider) = err.provider() else {
        return ThrottleClass::Fatal;
    };

    if provider.error_type.as_deref() == Some("tokens") {
        return ThrottleClass::TokenLimit;
    }

    let code = provider.code.as_deref();
    if code == Some("rate_limit_exceeded") {
        return ThrottleClass::RateLimit;
    }
    if provider.status == Some(413) || code == Some("request_too_large") {
        return ThrottleClass::PayloadTooLarge;
    }
    if provider.status == Some(429) {
        return ThrottleClass::RateLimit;
    }

    let message = provider.message.as_str();
    if message.contains("Requested") && message.contains("Limit") {
        return ThrottleClass::PayloadTooLarge;
    }

    ThrottleClass::Fatal
}

fn retry_hint_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)try again in ([\d.]+)s").ok())
        .as_ref()
}

/// Provider-suggested wait, in seconds
///
/// A structured `Retry-After` value wins over a `try again in Ns` phrase in the message.
pub fn retry_hint(provider: &ProviderError) -> Option<f64> {
    if let Some(after) = provider.retry_after {
        return Some(after.as_secs_f64());
    }

    retry_hint_regex()?
        .captures(&provider.message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Sleep this long, then retry
    Wait(Duration),
    /// Payload-too-large retries used up
    Exhausted,
    /// Not retryable; return the error as-is
    Propagate,
}

/// Per-call retry bookkeeping; lives only for one `run`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryAttemptContext {
    /// Payload-too-large retries taken
    pub general_attempts: u32,
    /// Token-limit and rate-limit retries taken
    pub rate_limit_attempts: u32,
    /// Consecutive request-rate limits since the last success or other retry
    pub consecutive_rate_limits: u32,
    /// Most recently computed wait
    pub last_wait: Option<Duration>,
}

impl RetryAttemptContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance counters for a failure and compute the next step
    ///
    /// `jitter` is a uniform sample in `[0, 1)`; it scales the extra wait added to
    /// request-rate limits (at most `RATE_LIMIT_JITTER` of the base wait). Every
    /// wait is clamped to `[0, MAX_WAIT_SECS]`, whatever the provider hinted.
    pub fn decide(
        &mut self,
        class: ThrottleClass,
        hint_secs: Option<f64>,
        config: &RetryConfig,
        jitter: f64,
    ) -> RetryDecision {
        let base_secs = config.initial_wait_ms as f64 / 1000.0;

        let wait_secs = match class {
            ThrottleClass::TokenLimit if config.infinite_rate_limit => {
                self.rate_limit_attempts += 1;
                hint_secs.unwrap_or(base_secs * self.rate_limit_attempts as f64)
            }
            ThrottleClass::RateLimit if config.infinite_rate_limit => {
                self.rate_limit_attempts += 1;
                self.consecutive_rate_limits += 1;
                let multiplier = self.consecutive_rate_limits.min(config.exponential_backoff_cap);
                let wait = hint_secs
                    .unwrap_or(base_secs * multiplier as f64)
                    .min(config.max_rate_limit_wait_secs);
                wait + wait * RATE_LIMIT_JITTER * jitter.clamp(0.0, 1.0)
            }
            ThrottleClass::PayloadTooLarge => {
                self.general_attempts += 1;
                self.consecutive_rate_limits = 0;
                if self.general_attempts > config.max_retries {
                    return RetryDecision::Exhausted;
                }
                hint_secs.unwrap_or(base_secs * self.general_attempts as f64)
            }
            _ => return RetryDecision::Propagate,
        };

        // f64::max/min discard NaN
        let wait = Duration::try_from_secs_f64(wait_secs.max(0.0).min(MAX_WAIT_SECS))
            .unwrap_or(Duration::ZERO);
        self.last_wait = Some(wait);
        RetryDecision::Wait(wait)
    }

    /// Reset after a successful call
    pub fn record_success(&mut self) {
        self.consecutive_rate_limits = 0;
    }
}

/// Async sink for retry progress messages
#[async_trait]
pub trait RetryLogger: Send + Sync {
    async fn log(&self, label: &str, message: &str);
}

/// Retry logger forwarding to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRetryLogger;

#[async_trait]
impl RetryLogger for TracingRetryLogger {
    async fn log(&self, label: &str, message: &str) {
        tracing::info!("[{}] {}", label, message);
    }
}

/// Retry/backoff wrapper for provider calls
#[derive(Clone)]
pub struct ThrottledInvoker {
    config: RetryConfig,
    logger: Arc<dyn RetryLogger>,
}

impl std::fmt::Debug for ThrottledInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledInvoker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for ThrottledInvoker {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl ThrottledInvoker {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            logger: Arc::new(TracingRetryLogger),
        }
    }

    /// Replace the retry logger
    pub fn with_logger(mut self, logger: Arc<dyn RetryLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation`, retrying throttling errors
    ///
    /// The operation is re-created for each attempt. Suspends the calling task
    /// during backoff sleeps.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = RetryAttemptContext::new();

        loop {
            let err = match operation().await {
                Ok(value) => {
                    ctx.record_success();
                    self.logger
                        .log(
                            label,
                            &format!(
                                "Success after {} rate limit retries and {} general retries",
                                ctx.rate_limit_attempts, ctx.general_attempts
                            ),
                        )
                        .await;
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = classify(&err);
            let hint = err.provider().and_then(retry_hint);
            let jitter = rand::thread_rng().gen::<f64>();

            match ctx.decide(class, hint, &self.config, jitter) {
                RetryDecision::Wait(wait) => {
                    let (what, attempt) = match class {
                        ThrottleClass::TokenLimit => ("Token limit hit", ctx.rate_limit_attempts),
                        ThrottleClass::RateLimit => ("Rate limited", ctx.rate_limit_attempts),
                        _ => ("Payload too large", ctx.general_attempts),
                    };
                    self.logger
                        .log(
                            label,
                            &format!(
                                "{}. Retrying in {:.1}s (attempt {})",
                                what,
                                wait.as_secs_f64(),
                                attempt
                            ),
                        )
                        .await;
                    tokio::time::sleep(wait).await;
                }
                RetryDecision::Exhausted => {
                    tracing::warn!("[{}] giving up: {}", label, err);
                    return Err(KilnError::PayloadTooLarge {
                        label: label.to_string(),
                        retries: self.config.max_retries,
                    });
                }
                RetryDecision::Propagate => {
                    tracing::debug!("[{}] not retryable: {}", label, err);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<String>>,
    }

    impl RecordingLogger {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        fn retries(&self) -> usize {
            self.lines()
                .iter()
                .filter(|l| l.contains("Retrying in"))
                .count()
        }
    }

    #[async_trait]
    impl RetryLogger for RecordingLogger {
        async fn log(&self, label: &str, message: &str) {
            self.lines
                .lock()
                .unwrap()
                .push(format!("[{}] {}", label, message));
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_wait_ms: 1,
            infinite_rate_limit: true,
            max_rate_limit_wait_secs: 0.005,
            exponential_backoff_cap: 10,
        }
    }

    fn rate_limited() -> KilnError {
        ProviderError::new("Rate limit reached")
            .with_code("rate_limit_exceeded")
            .into()
    }

    fn too_large() -> KilnError {
        ProviderError::new("Request too large: Requested 40000, Limit 30000").into()
    }

    #[test]
    fn test_classify() {
        let tokens: KilnError = ProviderError::new("x").with_type("tokens").into();
        assert_eq!(classify(&tokens), ThrottleClass::TokenLimit);
        assert_eq!(classify(&rate_limited()), ThrottleClass::RateLimit);

        let bare_429: KilnError = ProviderError::new("busy").with_status(429).into();
        assert_eq!(classify(&bare_429), ThrottleClass::RateLimit);

        let status_413: KilnError = ProviderError::new("nope").with_status(413).into();
        assert_eq!(classify(&status_413), ThrottleClass::PayloadTooLarge);
        assert_eq!(classify(&too_large()), ThrottleClass::PayloadTooLarge);

        let other: KilnError = ProviderError::new("invalid api key").with_status(401).into();
        assert_eq!(classify(&other), ThrottleClass::Fatal);
        assert_eq!(
            classify(&KilnError::Sandbox("gone".into())),
            ThrottleClass::Fatal
        );
    }

    #[test]
    fn test_retry_hint_prefers_header() {
        let err = ProviderError::new("Please try again in 2.5s.");
        assert_eq!(retry_hint(&err), Some(2.5));

        let err = err.with_retry_after(Duration::from_secs(7));
        assert_eq!(retry_hint(&err), Some(7.0));

        assert_eq!(retry_hint(&ProviderError::new("no hint")), None);
    }

    #[test]
    fn test_token_limit_wait_is_linear() {
        let config = RetryConfig::default();
        let mut ctx = RetryAttemptContext::new();

        let first = ctx.decide(ThrottleClass::TokenLimit, None, &config, 0.0);
        let second = ctx.decide(ThrottleClass::TokenLimit, None, &config, 0.0);
        assert_eq!(first, RetryDecision::Wait(Duration::from_secs(8)));
        assert_eq!(second, RetryDecision::Wait(Duration::from_secs(16)));

        let hinted = ctx.decide(ThrottleClass::TokenLimit, Some(1.5), &config, 0.0);
        assert_eq!(hinted, RetryDecision::Wait(Duration::from_millis(1500)));
        assert_eq!(ctx.consecutive_rate_limits, 0);
    }

    #[test]
    fn test_rate_limit_wait_grows_then_caps() {
        let config = RetryConfig {
            max_rate_limit_wait_secs: 60.0,
            exponential_backoff_cap: 4,
            ..RetryConfig::default()
        };
        let mut ctx = RetryAttemptContext::new();

        let waits: Vec<Duration> = (0..8)
            .map(|_| match ctx.decide(ThrottleClass::RateLimit, None, &config, 0.0) {
                RetryDecision::Wait(w) => w,
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        for pair in waits.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(waits[0], Duration::from_secs(8));
        // multiplier capped at 4 -> 32s, under the 60s ceiling
        assert_eq!(waits[7], Duration::from_secs(32));
        assert_eq!(ctx.consecutive_rate_limits, 8);
    }

    #[test]
    fn test_rate_limit_wait_never_exceeds_ceiling_with_jitter() {
        let config = RetryConfig::default();
        let ceiling = config.max_rate_limit_wait_secs * (1.0 + RATE_LIMIT_JITTER);
        let mut ctx = RetryAttemptContext::new();

        for i in 0..50 {
            let jitter = (i as f64 / 50.0).min(0.999);
            let hint = if i % 2 == 0 { Some(10_000.0) } else { None };
            match ctx.decide(ThrottleClass::RateLimit, hint, &config, jitter) {
                RetryDecision::Wait(w) => assert!(w.as_secs_f64() <= ceiling + 1e-9),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_huge_hints_are_clamped() {
        let config = RetryConfig::default();
        let ceiling = Duration::from_secs_f64(MAX_WAIT_SECS);
        let hint = retry_hint(&ProviderError::new(
            "Rate limit reached. Please try again in 100000000000000000000s.",
        ));
        assert_eq!(hint, Some(1e20));

        for class in [ThrottleClass::TokenLimit, ThrottleClass::PayloadTooLarge] {
            let mut ctx = RetryAttemptContext::new();
            assert_eq!(ctx.decide(class, hint, &config, 0.0), RetryDecision::Wait(ceiling));
        }

        let huge_config = RetryConfig {
            max_rate_limit_wait_secs: f64::MAX,
            ..RetryConfig::default()
        };
        let mut ctx = RetryAttemptContext::new();
        assert_eq!(
            ctx.decide(ThrottleClass::RateLimit, hint, &huge_config, 0.999),
            RetryDecision::Wait(ceiling)
        );
        assert_eq!(ctx.last_wait, Some(ceiling));
    }

    #[test]
    fn test_payload_too_large_caps_and_resets_streak() {
        let config = RetryConfig::default();
        let mut ctx = RetryAttemptContext::new();
        ctx.decide(ThrottleClass::RateLimit, None, &config, 0.0);
        assert_eq!(ctx.consecutive_rate_limits, 1);

        for attempt in 1..=config.max_retries {
            let decision = ctx.decide(ThrottleClass::PayloadTooLarge, None, &config, 0.0);
            assert_eq!(
                decision,
                RetryDecision::Wait(Duration::from_secs(8 * attempt as u64))
            );
        }
        assert_eq!(ctx.consecutive_rate_limits, 0);
        assert_eq!(
            ctx.decide(ThrottleClass::PayloadTooLarge, None, &config, 0.0),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_finite_rate_limit_propagates() {
        let config = RetryConfig {
            infinite_rate_limit: false,
            ..RetryConfig::default()
        };
        let mut ctx = RetryAttemptContext::new();
        assert_eq!(
            ctx.decide(ThrottleClass::RateLimit, None, &config, 0.0),
            RetryDecision::Propagate
        );
        assert_eq!(
            ctx.decide(ThrottleClass::TokenLimit, None, &config, 0.0),
            RetryDecision::Propagate
        );
    }

    #[tokio::test]
    async fn test_run_retries_rate_limit_k_times() {
        let logger = Arc::new(RecordingLogger::default());
        let invoker = ThrottledInvoker::new(fast_config()).with_logger(logger.clone());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let value = invoker
            .run("flaky", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 4 {
                    Err(rate_limited())
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(logger.retries(), 4);
        let lines = logger.lines();
        assert!(lines[0].starts_with("[flaky] Rate limited."));
        assert!(lines
            .last()
            .unwrap()
            .contains("Success after 4 rate limit retries and 0 general retries"));
    }

    #[tokio::test]
    async fn test_run_non_retryable_fails_first_attempt() {
        let logger = Arc::new(RecordingLogger::default());
        let invoker = ThrottledInvoker::new(fast_config()).with_logger(logger.clone());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<()> = invoker
            .run("fatal", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::new("invalid api key").with_status(401).into())
            })
            .await;

        assert!(matches!(result, Err(KilnError::Provider(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(logger.lines().is_empty());
    }

    #[tokio::test]
    async fn test_run_payload_too_large_exhausts() {
        let logger = Arc::new(RecordingLogger::default());
        let invoker = ThrottledInvoker::new(fast_config()).with_logger(logger.clone());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<()> = invoker
            .run("big", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(too_large())
            })
            .await;

        match result {
            Err(KilnError::PayloadTooLarge { label, retries }) => {
                assert_eq!(label, "big");
                assert_eq!(retries, 3);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(logger.retries(), 3);
    }

    #[tokio::test]
    async fn test_run_token_limit_uses_message_hint() {
        let invoker = ThrottledInvoker::new(fast_config());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let value = invoker
            .run("tpm", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::new("Please try again in 0.001s")
                        .with_type("tokens")
                        .into())
                } else {
                    Ok("ok")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
