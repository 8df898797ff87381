//! In-place retry of transient failures with exponential backoff

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::IngestResult;

/// Exponential backoff schedule: `base_delay * 2^(attempt - 1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// A policy that never waits, for dry runs and tests
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    /// Delay before the retry that follows `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Run `op` until it succeeds, fails terminally, or runs out of attempts
///
/// Only errors whose kind is retryable are retried; everything else is
/// returned immediately. The last transient error is returned once the
/// attempts are exhausted.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> IngestResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IngestResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = op_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.kind().is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, IngestError, StorageError};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 6);
        let delays: Vec<u64> = (1..=5).map(|a| policy.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_until_exhausted() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 6);
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: IngestResult<()> = with_backoff(&policy, "flaky", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::Transient("throttled".into()))
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), FailureKind::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        // 2 + 4 + 8 + 16 + 32
        assert_eq!(started.elapsed(), Duration::from_secs(62));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_error() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 6);
        let calls = AtomicU32::new(0);

        let value = with_backoff(&policy, "flaky", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(IngestError::Transient("timeout".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 6);
        let calls = AtomicU32::new(0);

        let result: IngestResult<()> = with_backoff(&policy, "parse", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::Parse("bad".into()))
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), FailureKind::Parse);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_storage_errors_are_not_retried() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 6);
        let calls = AtomicU32::new(0);

        let result: IngestResult<()> = with_backoff(&policy, "get", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Backend("AccessDenied".into()).into())
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), FailureKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
