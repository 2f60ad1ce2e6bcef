//! Background sweep task driven by a tokio interval.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Result, SlidegateError};
use crate::ratelimit::{Clock, RateLimiter, Timestamp};

/// Summary of a single sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Clock reading the sweep was evaluated against
    pub now: Timestamp,
    /// Keys removed by this sweep
    pub removed: usize,
    /// Keys still tracked afterwards
    pub remaining: usize,
}

/// Spawns the periodic sweep task.
pub struct Sweeper;

impl Sweeper {
    /// Start sweeping `limiter` every `interval`, reading the time from `clock`.
    ///
    /// The first sweep runs immediately. The task stops when the returned
    /// handle is shut down or dropped.
    pub fn spawn<K>(
        limiter: Arc<RateLimiter<K>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Result<SweeperHandle>
    where
        K: Eq + Hash + Debug + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(SlidegateError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let last_report = Arc::new(Mutex::new(None));
        let sweeps = Arc::new(AtomicU64::new(0));

        let report_slot = Arc::clone(&last_report);
        let sweep_count = Arc::clone(&sweeps);

        info!(interval_ms = interval.as_millis() as u64, "Starting sweeper");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = clock.now();
                        let removed = limiter.prune_inactive(now);
                        let report = SweepReport {
                            now,
                            removed,
                            remaining: limiter.tracked_keys(),
                        };
                        *report_slot.lock() = Some(report);
                        sweep_count.fetch_add(1, Ordering::Relaxed);
                    }
                    // Fires on an explicit shutdown and when the handle is dropped
                    _ = shutdown_rx.changed() => break,
                }
            }

            debug!("Sweeper stopped");
        });

        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            task,
            last_report,
            sweeps,
        })
    }
}

/// Handle to a running sweep task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    last_report: Arc<Mutex<Option<SweepReport>>>,
    sweeps: Arc<AtomicU64>,
}

impl SweeperHandle {
    /// Get the report from the most recent sweep, if one has run.
    pub fn last_report(&self) -> Option<SweepReport> {
        *self.last_report.lock()
    }

    /// Get the number of sweeps completed so far.
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sweeper task did not exit cleanly");
        }
    }
}
