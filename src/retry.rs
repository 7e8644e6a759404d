//! Retry with exponential backoff for whole window fetches.
//!
//! The HTTP client never retries on its own; the driver wraps each window in
//! [`retry_with_max_retries`] so a transient failure re-invokes the fetch from
//! the start of the window.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::HarvestError;

// ---

/// Backoff before retry number `attempt` (0-based): 100ms, 200ms, 400ms, ...
pub fn backoff(attempt: usize) -> Duration {
    Duration::from_millis(100 * (1u64 << attempt.min(10)))
}

/// Run `operation`, retrying retryable [`HarvestError`]s up to `max_retries` times.
pub async fn retry_with_max_retries<F, Fut, T>(
    max_retries: usize,
    operation_name: &str,
    mut operation: F,
) -> Result<T, HarvestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HarvestError>>,
{
    // ---
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() || attempt >= max_retries {
                    return Err(e);
                }

                warn!(
                    "Retryable error in {} (attempt {}/{}): {}",
                    operation_name,
                    attempt + 1,
                    max_retries,
                    e
                );

                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
        }
    }
}
