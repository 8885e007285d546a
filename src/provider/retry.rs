//! Retry policy shared by startup connects and tool invocation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::errors::GatewayError;

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay; attempt `n` waits `n × base` before attempt `n + 1`.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

type BackoffFn = dyn Fn(u32) -> Duration + Send + Sync;
type RetryableFn = dyn Fn(&GatewayError) -> bool + Send + Sync;

/// How many times to try, how long to wait between tries, and which errors
/// are worth another try.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Arc<BackoffFn>,
    is_retryable: Arc<RetryableFn>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff: impl Fn(u32) -> Duration + Send + Sync + 'static,
        is_retryable: impl Fn(&GatewayError) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
            is_retryable: Arc::new(is_retryable),
        }
    }

    /// Linear backoff (`attempt × base`) over transient errors.
    pub fn linear(max_attempts: u32, base: Duration) -> Self {
        Self::new(
            max_attempts,
            move |attempt| base * attempt,
            GatewayError::is_transient,
        )
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, |_| Duration::ZERO, |_| false)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }

    pub fn is_retryable(&self, err: &GatewayError) -> bool {
        (self.is_retryable)(err)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && self.is_retryable(&e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn timeout() -> GatewayError {
        GatewayError::RequestTimeout {
            id: "p".into(),
            method: "tools/call".into(),
            timeout_ms: 60_000,
        }
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = RetryPolicy::default()
            .run("op", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(timeout())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(timeout()) }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::RequestTimeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GatewayError::ConnectionLost {
                        id: "p".into(),
                        reason: "broken pipe".into(),
                    })
                }
            })
            .await;

        assert!(result.unwrap_err().is_connection_lost());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(0, |_| Duration::ZERO, |_| true);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }
}
