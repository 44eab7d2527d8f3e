//! Bounded, cancellable retry with linear backoff.
//!
//! After failed attempt `n` (0-indexed) the executor waits `(n + 1) * unit`
//! before trying again. Every error is retried the same way; the operation is
//! expected to be idempotent.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub unit: Duration,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        unit: Duration::from_secs(1),
    };

    pub const fn new(max_attempts: u32, unit: Duration) -> Self {
        Self { max_attempts, unit }
    }

    /// Wait after failed attempt `attempt` (0-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt.saturating_add(1))
    }

    /// Waits performed when every attempt fails.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.attempts().saturating_sub(1)).map(|attempt| self.delay_after(attempt))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("cancelled while waiting to retry")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last:#}")]
    Exhausted { attempts: u32, last: anyhow::Error },
}

impl RetryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Runs `operation` until it succeeds, the attempt cap is reached, or
/// `cancel` fires during a backoff wait.
pub async fn run_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt + 1 >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                last: err,
            });
        }

        let delay = policy.delay_after(attempt);
        warn!(
            attempt = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying: {:#}",
            err
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
