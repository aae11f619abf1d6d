//! Bounded exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::ExecutorConfig;
use crate::error::ProviderError;

/// Retry policy for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

impl RetryPolicy {
    /// Builds a policy from executor settings.
    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Returns the delay after failed attempt number `attempt` (1-based).
    ///
    /// A `retry-after` hint from the provider replaces the computed delay.
    /// Either way the delay never exceeds `max_backoff`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let delay = error.retry_after_secs().map_or_else(
            || {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                self.initial_backoff.saturating_mul(factor)
            },
            Duration::from_secs,
        );
        delay.min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds, fails fatally, or the attempt
    /// budget runs out.
    ///
    /// Returns the final result together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> (Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, &e);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {}ms",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        }
    }

    fn unavailable() -> ProviderError {
        ProviderError::Unavailable {
            status: 503,
            message: String::from("busy"),
        }
    }

    #[test]
    fn test_delay_doubles_until_capped() {
        let p = policy(10);
        let delays: Vec<u128> = (1..=6).map(|n| p.delay_for(n, &unavailable()).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(p.delay_for(64, &unavailable()), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_after_overrides_and_is_capped() {
        let p = RetryPolicy {
            max_backoff: Duration::from_secs(30),
            ..policy(3)
        };
        let limited = ProviderError::RateLimited { retry_after_secs: 2 };
        assert_eq!(p.delay_for(1, &limited), Duration::from_secs(2));

        let long = ProviderError::RateLimited { retry_after_secs: 600 };
        assert_eq!(p.delay_for(1, &long), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = policy(5)
            .run("create network.main", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok("net-1")
                }
            })
            .await;

        assert_eq!(result.expect("third call succeeds"), "net-1");
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_returns_last_error() {
        let (result, attempts) = policy(3)
            .run("create network.main", || async { Err::<(), _>(unavailable()) })
            .await;

        assert!(matches!(result, Err(ProviderError::Unavailable { .. })));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let (result, attempts) = policy(5)
            .run("create network.main", || async {
                Err::<(), _>(ProviderError::api_error(400, "bad cidr"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
