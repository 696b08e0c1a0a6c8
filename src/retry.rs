//! Bounded retry for hardware commands.
//!
//! This is the only place retries happen; no other component re-implements
//! retry logic. Waits and state transitions time out instead of retrying.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Runs an operation up to a bounded number of attempts with a fixed delay
/// between attempts.
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    /// Maximum number of attempts (not additional retries).
    pub max_attempts: u32,
    /// Delay between attempts; not applied after the last one.
    pub delay: Duration,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryExecutor {
    /// An executor with the given attempt bound and inter-attempt delay.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Call `op` until it succeeds or the attempt bound is exhausted.
    ///
    /// Returns `true` on the first success. Operation errors are reported
    /// per-attempt and swallowed; this method never propagates them.
    pub async fn execute<F, Fut>(&self, name: &str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        for attempt in 1..=self.max_attempts {
            debug!(op = name, attempt, max = self.max_attempts, "Attempting operation");
            match op().await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(op = name, attempt, "Operation succeeded after retry");
                    }
                    return true;
                }
                Err(e) => {
                    warn!(op = name, attempt, max = self.max_attempts, error = %e, "Attempt failed");
                }
            }
            if attempt < self.max_attempts {
                sleep(self.delay).await;
            }
        }
        error!(op = name, attempts = self.max_attempts, "Operation failed after all attempts");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Operation that fails until the `succeed_on`-th call.
    fn flaky_op(
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        move || {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= succeed_on {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("attempt {} failed", n))
                }
            })
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(3, Duration::from_millis(10));
        let ok = executor.execute("flaky", flaky_op(calls.clone(), 3)).await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_immediately_on_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(5, Duration::from_millis(10));
        let ok = executor.execute("ok", flaky_op(calls.clone(), 1)).await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_and_reports_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(3, Duration::from_millis(10));
        let ok = executor.execute("dead", flaky_op(calls.clone(), 100)).await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_every_attempt_is_reported() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(2, Duration::from_millis(10));
        let ok = executor.execute("ion gauge hv on", flaky_op(calls, 100)).await;
        assert!(!ok);
        assert!(logs_contain("Attempt failed"));
        assert!(logs_contain("Operation failed after all attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_applied_between_attempts_only() {
        let calls = Arc::new(AtomicU32::new(0));
        let delay = Duration::from_secs(2);
        let executor = RetryExecutor::new(4, delay);

        let started = tokio::time::Instant::now();
        let ok = executor.execute("dead", flaky_op(calls.clone(), 100)).await;
        let elapsed = started.elapsed();

        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // delay × (attempts − 1): no sleep after the final attempt
        assert_eq!(elapsed, delay * 3);
    }
}
