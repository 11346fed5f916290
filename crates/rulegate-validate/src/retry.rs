use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rulegate_core::Settings;

use crate::engine::InvocationError;

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    Failed(InvocationError),
    Cancelled,
}

/// Max attempts, exponential backoff schedule and a retryable predicate,
/// wrapped around any fallible async operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retryable: fn(&InvocationError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            retryable: InvocationError::is_transient,
        }
    }
}

impl From<&Settings> for RetryPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no backoff.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed attempt `attempt` (1-based): initial × 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `cancel` fires. Returns the outcome and the number of
    /// attempts started. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> (Result<T, Stop>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InvocationError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return (Err(Stop::Cancelled), attempt);
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (Err(Stop::Cancelled), attempt),
                r = op(attempt) => r,
            };

            match result {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if attempt < max_attempts && (self.retryable)(&e) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(attempt, ?delay, error = %e, "retrying after backoff");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return (Err(Stop::Cancelled), attempt),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return (Err(Stop::Failed(e)), attempt),
            }
        }
    }
}
