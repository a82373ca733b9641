//! Best-effort execution for bookkeeping that must not mask a primary error
//!
//! When a job has already failed, writing the failure record is secondary: the
//! caller still returns the job's own error, whatever happens here. The
//! bookkeeping error is logged and swallowed instead.
//!
//! Not for agent turns, tool calls or provider calls. Those have their own
//! error paths.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Base delay between best-effort attempts; attempt `n` waits `n` times this
const ATTEMPT_DELAY: Duration = Duration::from_millis(100);

/// Run `f` up to `attempts` times with a linearly growing delay
///
/// Returns the first success, or `None` once every attempt failed. Zero
/// attempts never calls `f`.
///
/// ```no_run
/// use kiln_core::fail_open::fail_open_with_retries;
/// use kiln_core::Result;
///
/// async fn write_failure_record() -> Result<String> {
///     Ok("message-id".to_string())
/// }
///
/// async fn example() {
///     let id = fail_open_with_retries("record_job_failure", write_failure_record, 3).await;
///     // None when the store rejected every write
/// }
/// ```
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    attempts: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Some(value),
            Err(e) if attempt < attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, attempts, e
                );
                tokio::time::sleep(ATTEMPT_DELAY * attempt as u32).await;
            }
            Err(e) => {
                warn!(
                    "{} gave up after {} attempt(s) (fail-open): {}",
                    operation_name, attempts, e
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KilnError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store stand-in that rejects the first `failures` writes
    struct FlakyStore {
        failures: usize,
        writes: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                writes: AtomicUsize::new(0),
            }
        }

        async fn write(&self) -> Result<String> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(KilnError::Store("database is locked".to_string()))
            } else {
                Ok(format!("msg-{}", n))
            }
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_first_success_passes_through() {
        let store = FlakyStore::new(0);
        let id = fail_open_with_retries("record", || store.write(), 3).await;
        assert_eq!(id.as_deref(), Some("msg-0"));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_retries_until_store_recovers() {
        let store = FlakyStore::new(2);
        let id = fail_open_with_retries("record", || store.write(), 3).await;
        assert_eq!(id.as_deref(), Some("msg-2"));
        assert_eq!(store.writes(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_all_attempts() {
        let store = FlakyStore::new(10);
        assert!(fail_open_with_retries("record", || store.write(), 2).await.is_none());
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_never_runs() {
        let store = FlakyStore::new(0);
        assert!(fail_open_with_retries("record", || store.write(), 0).await.is_none());
        assert_eq!(store.writes(), 0);
    }
}
