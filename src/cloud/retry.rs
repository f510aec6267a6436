//! Retry with exponential backoff for remote operations

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

use super::RetryPolicy;

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up
pub fn with_retry<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(
                    operation = what,
                    attempt,
                    max_attempts = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Remote operation failed, retrying"
                );
                thread::sleep(backoff);
                backoff = next_backoff(backoff, policy.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
