//! Bounded retry with exponential backoff for transient failures
//!
//! Stages and repositories hit the same classes of transient trouble
//! (storage locks, brief connection drops); both retry through this helper
//! so the backoff policy lives in one place.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling on the delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Policy for transient I/O inside a pipeline stage
    pub fn for_stage_io() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Execute an operation with retry on transient errors
///
/// `is_retryable` decides whether a given failure is worth another attempt;
/// non-retryable errors return immediately.
pub async fn with_retry<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut operation: F,
    is_retryable: P,
    operation_name: &str,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded on attempt {}/{}",
                        operation_name, attempt, config.max_attempts
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                if attempt < config.max_attempts {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        "Operation '{}' failed on attempt {}/{}, retrying in {:?}: {}",
                        operation_name, attempt, config.max_attempts, delay, err
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                } else {
                    warn!(
                        "Operation '{}' failed after {} attempts: {}",
                        operation_name, config.max_attempts, err
                    );
                    last_error = Some(err);
                }
            }
        }
    }

    Err(last_error.expect("retry loop always records an error before exhausting"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<&str, String> = with_retry(
            &quick_config(3),
            || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("locked".to_string())
                    } else {
                        Ok("done")
                    }
                }
            },
            |_| true,
            "test_op",
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), String> = with_retry(
            &quick_config(5),
            || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("schema mismatch".to_string())
                }
            },
            |_| false,
            "test_op",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let result: Result<(), String> = with_retry(
            &quick_config(2),
            || async { Err("still locked".to_string()) },
            |_| true,
            "test_op",
        )
        .await;

        assert_eq!(result.unwrap_err(), "still locked");
    }

    #[test]
    fn delay_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(300));
    }
}
