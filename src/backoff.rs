//! Exponential backoff with jitter for connect retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Delay before the first retry.
pub const BASE_DELAY_MS: u64 = 100;

/// Upper bound on a single retry delay.
pub const MAX_DELAY_MS: u64 = 2_000;

/// Calculate exponential backoff delay with jitter.
///
/// `attempt` is 1-based; attempt 0 never waits.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    // Jitter of up to 10% of the delay.
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Run `op` once, then up to `max_retry` more times while it fails.
///
/// Returns the last error when every attempt fails.
pub async fn retry<T, F, Fut>(max_retry: u32, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_retry => {
                attempt += 1;
                let delay = calculate_backoff(attempt, BASE_DELAY_MS, MAX_DELAY_MS);
                warn!(
                    "connect attempt {} of {} failed: {:#}; retrying in {:?}",
                    attempt,
                    max_retry + 1,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
