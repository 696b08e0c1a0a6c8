//! Cancellable polling wait on a boolean condition.
//!
//! All bounded waits in the sequencer go through [`wait_for`]: the predicate
//! is polled at a fixed one-second cadence, a progress callback fires on its
//! own (usually coarser) interval, and an operator stop raised between polls
//! ends the wait with a [`WaitOutcome::Cancelled`] result distinct from
//! [`WaitOutcome::TimedOut`], so the caller can tell "operator aborted" from
//! "hardware never reached the condition".

use crate::core::StopSignal;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Fixed predicate polling cadence; the progress interval only gates how
/// often the progress callback fires.
pub const POLL_PERIOD: Duration = Duration::from_secs(1);

/// How a bounded wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate became true within the bound
    Satisfied,
    /// The bound elapsed without the predicate becoming true
    TimedOut,
    /// A stop was requested while waiting
    Cancelled,
}

impl WaitOutcome {
    /// Whether the awaited condition was met.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, WaitOutcome::Satisfied)
    }
}

/// Poll `predicate` once per second until it holds, `max_wait` elapses, or
/// `stop` is raised.
///
/// `on_progress(elapsed, remaining)` fires at most once per
/// `progress_interval`. The predicate is evaluated immediately on entry, so
/// an already-true condition returns without sleeping.
pub async fn wait_for<P, G>(
    what: &str,
    mut predicate: P,
    max_wait: Duration,
    progress_interval: Duration,
    stop: &StopSignal,
    mut on_progress: G,
) -> WaitOutcome
where
    P: FnMut() -> bool,
    G: FnMut(Duration, Duration),
{
    debug!(what, timeout = ?max_wait, "Waiting for condition");
    let started = tokio::time::Instant::now();
    let mut last_progress = Duration::ZERO;

    loop {
        if stop.is_raised() {
            info!(what, elapsed = ?started.elapsed(), "Wait cancelled by stop request");
            return WaitOutcome::Cancelled;
        }

        if predicate() {
            debug!(what, elapsed = ?started.elapsed(), "Condition met");
            return WaitOutcome::Satisfied;
        }

        let elapsed = started.elapsed();
        if elapsed >= max_wait {
            warn!(what, timeout = ?max_wait, "Condition not met within timeout");
            return WaitOutcome::TimedOut;
        }

        if elapsed - last_progress >= progress_interval {
            on_progress(elapsed, max_wait - elapsed);
            last_progress = elapsed;
        }

        sleep(POLL_PERIOD.min(max_wait - elapsed)).await;
    }
}
