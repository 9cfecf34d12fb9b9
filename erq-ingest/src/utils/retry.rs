//! Retry with exponential backoff
//!
//! Used for source fetches. The operation decides what is transient through
//! the `retryable` predicate; anything else fails at once.

use std::fmt::Display;
use std::time::{Duration, Instant};

/// Attempt count and delay bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &erq_common::config::IngestConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            initial_delay: Duration::from_millis(config.retry_initial_ms),
            max_delay: Duration::from_millis(config.retry_max_ms.max(config.retry_initial_ms)),
        }
    }

    /// Delay slept after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are spent
///
/// **Backoff Strategy:**
/// - Initial delay: `policy.initial_delay`
/// - Multiplier: 2.0 (exponential)
/// - Max delay: `policy.max_delay`
///
/// The last error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    operation_name: &str,
    policy: RetryPolicy,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let start_time = Instant::now();
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        if attempt > 1 {
            tracing::debug!(operation = operation_name, attempt, "Retrying operation");
        }

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis(),
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !retryable(&err) {
                    tracing::warn!(operation = operation_name, attempt, error = %err, "Non-retryable failure");
                    return Err(err);
                }

                if attempt >= attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis(),
                        error = %err,
                        "Operation failed: retries exhausted"
                    );
                    return Err(err);
                }

                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
