//! Synthetic concurrent load against a shared limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SlidegateError;
use crate::ratelimit::{Clock, RateLimiter};

/// Parameters for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Number of distinct keys requests are spread across
    pub keys: usize,
    /// Number of concurrent worker tasks
    pub workers: usize,
    /// How long to run before stopping on our own
    pub duration: Duration,
    /// Pause between requests from a single worker
    pub pace: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            keys: 16,
            workers: 4,
            duration: Duration::from_secs(10),
            pace: Duration::from_millis(5),
        }
    }
}

/// Totals collected from every worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimulationStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Requests refused because another worker's later clock reading
    /// reached the key first
    pub out_of_order: u64,
    /// Keys still tracked when the run ended
    pub tracked_keys: usize,
}

impl SimulationStats {
    fn merge(&mut self, other: SimulationStats) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.out_of_order += other.out_of_order;
    }
}

/// Drive `limiter` from `options.workers` tasks until the duration elapses
/// or `shutdown` resolves, whichever comes first.
pub async fn simulate<F>(
    limiter: Arc<RateLimiter<String>>,
    clock: Arc<dyn Clock>,
    options: SimulationOptions,
    shutdown: F,
) -> SimulationStats
where
    F: Future<Output = ()> + Send,
{
    let keys = options.keys.max(1);
    let (stop_tx, stop_rx) = watch::channel(false);

    info!(
        keys = keys,
        workers = options.workers,
        duration_ms = options.duration.as_millis() as u64,
        "Starting simulation"
    );

    let handles: Vec<_> = (0..options.workers)
        .map(|worker| {
            let limiter = Arc::clone(&limiter);
            let clock = Arc::clone(&clock);
            let stop = stop_rx.clone();
            let pace = options.pace;
            tokio::spawn(async move {
                let mut rng = StdRng::from_entropy();
                let mut stats = SimulationStats::default();

                while !*stop.borrow() {
                    let key = format!("key-{}", rng.gen_range(0..keys));
                    match limiter.try_allow_request(clock.now(), key) {
                        Ok(decision) if decision.allowed => stats.accepted += 1,
                        Ok(_) => stats.rejected += 1,
                        Err(SlidegateError::OutOfOrder { .. }) => stats.out_of_order += 1,
                        Err(e) => warn!(worker = worker, error = %e, "Admission check failed"),
                    }
                    tokio::time::sleep(pace).await;
                }

                debug!(worker = worker, ?stats, "Worker stopped");
                stats
            })
        })
        .collect();

    tokio::select! {
        _ = tokio::time::sleep(options.duration) => {
            debug!("Simulation duration elapsed");
        }
        _ = shutdown => {
            info!("Simulation interrupted");
        }
    }
    let _ = stop_tx.send(true);

    let mut totals = SimulationStats::default();
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(stats) => totals.merge(stats),
            Err(e) => warn!(error = %e, "Simulation worker failed"),
        }
    }
    totals.tracked_keys = limiter.tracked_keys();

    info!(
        accepted = totals.accepted,
        rejected = totals.rejected,
        out_of_order = totals.out_of_order,
        tracked_keys = totals.tracked_keys,
        "Simulation finished"
    );
    totals
}
