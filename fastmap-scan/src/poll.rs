//! Bounded async polling.

use crate::error::{Error, Result};
use fastmap_core::RetryPolicy;
use std::future::Future;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Awaits `probe` every `policy.interval()` until it reports `true`.
///
/// # Errors
/// [`Error::Timeout`] naming `what` once the policy's timeout or attempt
/// budget is spent; errors from `probe` are returned at once.
pub async fn poll_until<F, Fut>(policy: &RetryPolicy, what: &'static str, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if probe().await? {
            debug!(what, attempts, elapsed = ?started.elapsed(), "poll satisfied");
            return Ok(());
        }
        let waited = started.elapsed();
        let spent = policy.max_attempts > 0 && attempts >= policy.max_attempts;
        if spent || waited >= policy.timeout() {
            return Err(Error::Timeout { what, waited });
        }
        sleep(policy.interval()).await;
    }
}
