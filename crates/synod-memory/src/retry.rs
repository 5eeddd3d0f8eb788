//! Bounded retry with exponential backoff
//!
//! Only [`BackendUnavailable`](crate::error::SynodError::BackendUnavailable)
//! is retried; every other error is returned on the first occurrence.

use crate::config::RetryConfig;
use crate::error::SynodResult;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            multiplier: f64::from(config.backoff_multiplier),
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_backoff_ms as f64 * factor).round() as u64;
        Duration::from_millis(millis.min(self.max_backoff_ms))
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SynodResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SynodResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying backend operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SynodError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = fast_policy(5);
        assert_eq!(policy.backoff(1), Duration::from_millis(1));
        assert_eq!(policy.backoff(2), Duration::from_millis(2));
        assert_eq!(policy.backoff(3), Duration::from_millis(4));
        assert_eq!(policy.backoff(4), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_retries_backend_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("search", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SynodError::backend_unavailable("search", "timeout"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: SynodResult<()> = fast_policy(2)
            .run("search", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SynodError::backend_unavailable("search", "timeout"))
            })
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let result: SynodResult<()> = fast_policy(5)
            .run("delete", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SynodError::not_found("memory", "m1"))
            })
            .await;

        assert!(matches!(result, Err(SynodError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
