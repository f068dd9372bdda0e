//! Bounded retries with exponential backoff.
//!
//! The controller only looks at `StageError::kind()`: recoverable failures are
//! retried after `min(initial * base^retry, max)`, fatal ones return at once.

use crate::models::{FailureKind, RetryConfig, StageError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: f64,
    pub max_backoff: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: cfg.initial_backoff_secs,
            max_backoff: cfg.max_backoff_secs,
            exponential_base: cfg.exponential_base,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = (self.initial_backoff * self.exponential_base.powi(exponent))
            .min(self.max_backoff)
            .max(0.0);
        to_duration(secs)
    }

    /// Delay to apply after `error`, honouring a provider retry-after hint.
    fn delay_after(&self, retry: u32, error: &StageError) -> Duration {
        let base = self.delay_for(retry);
        match error.retry_after() {
            Some(hint) if hint.is_finite() && hint > base.as_secs_f64() => {
                to_duration(hint.min(self.max_backoff).max(0.0))
            }
            _ => base,
        }
    }
}

/// Seconds to a `Duration`, saturating instead of panicking on huge or NaN values.
fn to_duration(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, StageError>,
    /// Total attempts made, including the first
    pub attempts: u32,
    /// Delays actually slept between attempts
    pub delays: Vec<Duration>,
}

impl<T> RetryOutcome<T> {
    /// Retries performed after the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Runs an operation under a `RetryPolicy`.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails fatally, or retries run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut delays = Vec::new();
        let mut attempt = 1u32;

        loop {
            let error = match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        delays,
                    };
                }
                Err(e) => e,
            };

            let retry = attempt - 1;
            match error.kind() {
                FailureKind::Fatal => {
                    debug!(operation = label, attempt, error = %error, "Fatal failure, not retrying");
                }
                FailureKind::Recoverable if retry < self.policy.max_retries => {
                    let delay = self.policy.delay_after(retry, &error);
                    warn!(
                        operation = label,
                        attempt,
                        backoff_secs = delay.as_secs_f64(),
                        error = %error,
                        "Recoverable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delays.push(delay);
                    attempt += 1;
                    continue;
                }
                FailureKind::Recoverable => {
                    warn!(operation = label, attempts = attempt, error = %error, "Retries exhausted");
                }
            }

            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
                delays,
            };
        }
    }
}
