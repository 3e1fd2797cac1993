//! Bounded retry with exponential backoff.

use crate::config::RetryConfig;
use crate::error::EntitlementResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retries a fallible async operation while its error is retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempts count from 1).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` up to `max_attempts` times. Non-retryable errors return
    /// immediately; the last error is returned once attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> EntitlementResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EntitlementResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{what} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
