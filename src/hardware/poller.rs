//! Periodic status poller.
//!
//! Samples a [`SnapshotSource`] at a fixed cadence and publishes each sample
//! as an immutable [`RigSnapshot`] through a `tokio::sync::watch` channel.
//! Consumers (the sequencer, the shutdown coordinator, a UI) only ever read
//! the latest published snapshot; nothing mutates shared status in place.

use crate::core::RigSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Anything that can produce a point-in-time status snapshot.
///
/// For the simulated rig this samples the plant; a real rig would aggregate
/// the per-device status queries here.
pub trait SnapshotSource: Send + Sync {
    /// Take a snapshot of the current rig status.
    fn sample(&self) -> RigSnapshot;
}

/// Spawns the snapshot publishing task.
pub struct StatusPoller;

impl StatusPoller {
    /// Start polling `source` every `cadence`, publishing through the
    /// returned receiver. The first snapshot is taken synchronously so the
    /// channel never holds a placeholder. The task ends when every receiver
    /// is dropped.
    pub fn spawn(
        source: Arc<dyn SnapshotSource>,
        cadence: Duration,
    ) -> (watch::Receiver<RigSnapshot>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(source.sample());
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    debug!("All snapshot receivers dropped, stopping poller");
                    break;
                }
                tx.send_replace(source.sample());
            }
        });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        samples: AtomicU32,
    }

    impl SnapshotSource for CountingSource {
        fn sample(&self) -> RigSnapshot {
            let n = self.samples.fetch_add(1, Ordering::SeqCst);
            RigSnapshot {
                chamber_pressure_torr: f64::from(n),
                ..Default::default()
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_fresh_snapshots_at_cadence() {
        let source = Arc::new(CountingSource {
            samples: AtomicU32::new(0),
        });
        let (rx, _handle) = StatusPoller::spawn(source.clone(), Duration::from_millis(500));

        // Initial sample is available immediately
        assert_eq!(rx.borrow().chamber_pressure_torr, 0.0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let latest = rx.borrow().chamber_pressure_torr;
        assert!(latest >= 5.0, "expected several refreshes, got {latest}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_when_receivers_drop() {
        let source = Arc::new(CountingSource {
            samples: AtomicU32::new(0),
        });
        let (rx, handle) = StatusPoller::spawn(source, Duration::from_millis(100));
        drop(rx);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.is_finished());
    }
}
