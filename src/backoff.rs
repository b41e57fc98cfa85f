//! Retry-with-exponential-delay wrapper for network calls.
//!
//! DESIGN
//! ======
//! Four attempts total, sleeping 400ms, 800ms, then 1600ms between them
//! (capped at 5s). Errors are classified through [`Classify`]: auth and
//! other 4xx rejections abort on the first failure, 5xx and transport
//! failures are retried. The last error is returned unchanged once the
//! attempt ceiling is hit.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Classify;

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_BASE_DELAY_MS: u64 = 400;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << shift)
            .min(self.max_delay)
    }
}

/// Run `operation` under the default policy.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once all
/// attempts are spent.
pub async fn with_backoff<T, E, F, Fut>(operation: F, label: &str) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    with_backoff_policy(BackoffPolicy::default(), operation, label).await
}

/// Run `operation` under an explicit policy.
///
/// # Errors
///
/// Same as [`with_backoff`].
pub async fn with_backoff_policy<T, E, F, Fut>(policy: BackoffPolicy, mut operation: F, label: &str) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let kind = err.failure_kind();
                if !kind.is_retryable() {
                    debug!(label, attempt, ?kind, error = %err, "non-retryable failure");
                    return Err(err);
                }
                if attempt >= max_attempts {
                    warn!(label, attempts = attempt, error = %err, "retries exhausted");
                    return Err(err);
                }
                let delay = policy.delay_after(attempt);
                warn!(
                    label,
                    attempt,
                    total = max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
