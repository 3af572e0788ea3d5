//! Retry and backoff policy.
//!
//! A small pure function; the loops invoke it without framework support.
//! Repository-level retries are deliberately NOT applied: the repository
//! surfaces errors directly and its callers decide.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Default attempt budget for the ingester's retry envelopes.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff ceiling.
const MAX_BACKOFF_SECS: u64 = 64;

/// Returns how long to wait before retry attempt `attempt`.
///
/// Exponential with base 2 and no jitter: attempt `k` waits `2^k` seconds,
/// capped at 64 seconds. Attempt numbering starts at 1.
#[must_use]
pub fn retry_after(attempt: u32) -> Duration {
    let secs = 2_u64
        .checked_pow(attempt)
        .unwrap_or(MAX_BACKOFF_SECS)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Runs `operation` up to `max_attempts` times, sleeping
/// [`retry_after`] between failures.
///
/// The last error is returned when the budget is exhausted.
///
/// # Errors
///
/// Returns the final attempt's error.
pub async fn retry_async<T, E, F, Fut>(
    max_attempts: u32,
    mut operation: F,
) -> std::result::Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                let wait = retry_after(attempt);
                warn!(attempt, wait_secs = wait.as_secs(), error = %err, "retrying after failure");
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}
