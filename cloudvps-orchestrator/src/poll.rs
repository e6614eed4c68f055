//! Bounded polling on the tokio clock.
//!
//! Waits go through `tokio::time`, so tests running on a paused runtime
//! (`#[tokio::test(start_paused = true)]`) advance through them instantly.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    TimedOut { waited: Duration },
    Cancelled,
    Failed(E),
}

/// Call `check` every `interval` until it yields a value, fails, the deadline
/// passes or `cancel` fires. `check` always runs at least once.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => return Err(PollError::Failed(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut {
                waited: now - started,
            });
        }
        let nap = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = sleep(nap) => {}
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

/// Delay before retry number `attempt` (1-based): `base`, `2*base`, `4*base`, ...
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}
