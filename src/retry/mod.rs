//! Retry and polling primitives shared by every provider adapter.
//!
//! Cloud APIs acknowledge requests long before the resource they describe
//! settles. These helpers bridge that gap: [`retry`] and
//! [`retry_conditional`] bound work by attempt count, while
//! [`wait_until_ready`] bounds a status poll by wall-clock time. All of them
//! sleep at a constant interval; there is no backoff growth.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Errors surfaced by [`wait_until_ready`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PollError<E> {
    /// Raised when the check never reported completion within the timeout.
    #[error("time limit exceeded after {elapsed:?}")]
    TimeLimitExceeded {
        /// Time spent polling before giving up.
        elapsed: Duration,
    },
    /// Raised when the check itself failed.
    #[error(transparent)]
    Check(E),
}

impl<E> PollError<E> {
    /// Returns `true` when the poll ran out of time rather than failing.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeLimitExceeded { .. })
    }
}

/// Calls `op` up to `attempts` times, sleeping `delay` between attempts.
///
/// Stops at the first success. When every attempt fails the error from the
/// final attempt is returned. An `attempts` value of zero is treated as one.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn retry<T, E, F, Fut>(attempts: u32, delay: Duration, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_conditional(attempts, delay, |_: &E| true, op).await
}

/// Like [`retry`], but stops immediately when `should_retry` rejects an
/// error, returning that error without exhausting the remaining attempts.
///
/// Which errors are worth retrying is adapter policy; the predicate is the
/// only place that policy is expressed.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once all
/// attempts are used.
pub async fn retry_conditional<T, E, F, Fut, P>(
    attempts: u32,
    delay: Duration,
    mut should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let limit = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= limit || !should_retry(&err) => return Err(err),
            Err(_) => {
                debug!(attempt, attempts = limit, "operation failed; retrying");
                attempt += 1;
                sleep(delay).await;
            }
        }
    }
}

/// Polls `check` every `interval` until it reports completion, fails, or
/// `timeout` elapses.
///
/// `check` resolves to `Ok(true)` when done and `Ok(false)` when it should be
/// polled again. A check that is done on its first call returns without
/// sleeping. The helper accepts no cancellation token; callers needing one
/// drop the future or wrap it in [`tokio::time::timeout`].
///
/// # Errors
///
/// Returns [`PollError::Check`] when `check` fails and
/// [`PollError::TimeLimitExceeded`] when the timeout elapses first.
pub async fn wait_until_ready<E, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        if check().await.map_err(PollError::Check)? {
            return Ok(());
        }
        if Instant::now() + interval > deadline {
            return Err(PollError::TimeLimitExceeded {
                elapsed: started.elapsed(),
            });
        }
        sleep(interval).await;
    }
}
