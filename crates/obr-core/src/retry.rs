//! Retry/resume controller for bulk store operations.
//!
//! A bulk operation that fails with a transient error (see
//! [`Error::is_transient`]) is re-issued from scratch after an exponential
//! backoff. Replaying is safe because every stage selects its input by
//! workflow state: rows committed before the failure are no longer selected.
//! Non-transient errors are returned immediately.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::defaults;
use crate::error::{Error, Result};

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first. `1` disables retrying.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(defaults::RETRY_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(defaults::RETRY_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Load the policy from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OBR_RETRY_MAX_ATTEMPTS` | `5` |
    /// | `OBR_RETRY_INITIAL_BACKOFF_MS` | `100` |
    /// | `OBR_RETRY_MAX_BACKOFF_MS` | `5000` |
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("OBR_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::RETRY_MAX_ATTEMPTS)
            .max(1);

        let initial_backoff_ms = std::env::var("OBR_RETRY_INITIAL_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RETRY_INITIAL_BACKOFF_MS);

        let max_backoff_ms = std::env::var("OBR_RETRY_MAX_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RETRY_MAX_BACKOFF_MS)
            .max(initial_backoff_ms);

        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Sleep before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Run `operation`, replaying it on transient failures according to `policy`.
///
/// Returns [`Error::RetriesExhausted`] when the last attempt also fails
/// transiently.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        subsystem = "retry",
                        op = operation_name,
                        attempt,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    error!(
                        subsystem = "retry",
                        op = operation_name,
                        attempt,
                        duration_ms = start.elapsed().as_millis() as u64,
                        error = %err,
                        "Transient failure persisted, giving up"
                    );
                    return Err(Error::RetriesExhausted {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }

                let backoff = policy.backoff_for(attempt);
                warn!(
                    subsystem = "retry",
                    op = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient() -> Error {
        Error::Database(sqlx::Error::PoolTimedOut)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_max_attempts_floor_is_one() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let result = with_retry(&RetryPolicy::default(), "op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&RetryPolicy::default(), "op", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let policy = RetryPolicy::default().with_max_attempts(3);

        let result: Result<()> = with_retry(&policy, "commit_expansion", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        match result {
            Err(Error::RetriesExhausted {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "commit_expansion");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry(&RetryPolicy::default(), "op", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidInput("bad".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
