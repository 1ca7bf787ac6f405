//! Bounded retries for request/response style operations.

use crate::error::{AdapterError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default number of attempts for a request
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default delay between request attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Fixed-delay retry policy for a single data-plane call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds or the attempts run out.
    ///
    /// Only request and connection failures are retried. Pipeline
    /// rejections and `NotConnected` are returned straight away.
    pub async fn run<F, Fut, T>(&self, protocol: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => {
                    warn!(
                        protocol,
                        "Request failed (attempt {}/{}): {}", attempt, attempts, e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        Err(AdapterError::RetriesExhausted {
            attempts,
            last_error,
        })
    }
}

fn is_retryable(error: &AdapterError) -> bool {
    matches!(
        error,
        AdapterError::Request(_)
            | AdapterError::Connection(_)
            | AdapterError::Io(_)
            | AdapterError::Parse(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        let calls = AtomicU32::new(0);

        let start = tokio::time::Instant::now();
        let value = policy
            .run("http_client", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AdapterError::Request("503".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted() {
        let policy = RetryPolicy::default();
        let err = policy
            .run("http_client", |_| async {
                Err::<(), _>(AdapterError::Request("refused".into()))
            })
            .await
            .unwrap_err();

        match err {
            AdapterError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_validation_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        let err = policy
            .run("graphql_client", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AdapterError::Validation("bad".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
