//! Bounded retry with exponential backoff
//!
//! Every directory and storage call goes through [`retry`]: each attempt runs
//! under a deadline, retryable failures back off exponentially with jitter,
//! and the caller's cancel token interrupts both the attempt and the sleep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline applied to each attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits long; handy for tests and local backends
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        }
    }

    /// Delay before retry number `attempt` (1-based), with up to 50% jitter
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let jitter_cap = (base.as_millis() as u64) / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails terminally, or attempts run out.
///
/// Only [`VaultError::is_retryable`] errors are retried. An attempt that
/// exceeds `policy.timeout` counts as [`VaultError::Timeout`].
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancelToken,
    mut op: F,
) -> VaultResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VaultResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        cancel.check()?;
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(VaultError::Cancelled),
            outcome = tokio::time::timeout(policy.timeout, op()) => match outcome {
                Ok(result) => result,
                Err(_) => Err(VaultError::Timeout {
                    operation: operation.to_string(),
                    millis: policy.timeout.as_millis() as u64,
                }),
            },
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation,
                    attempt,
                    max_attempts,
                    delay.as_millis(),
                    err
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
