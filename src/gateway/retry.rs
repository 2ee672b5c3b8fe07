use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::errors::{Error, Result};

/// Exponential backoff for gateway calls
///
/// Only [`Error::TransientGateway`] is retried. Any other error is returned
/// as-is on the first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(200))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the next attempt, after `attempt` failures
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(2u32.pow(exponent))
    }

    /// Execute with exponential backoff retry
    pub async fn run<T, F, Fut>(&self, what: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        return Err(Error::RetriesExhausted {
                            attempts,
                            reason: e.to_string(),
                        });
                    }

                    let delay = self.delay_for(attempts);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        what,
                        attempts,
                        self.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
