//! Periodic backup trigger.

use crate::executor::BackupOrchestrator;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs a backup cycle every `interval` until cancelled.
///
/// Each cycle is awaited before the next tick is taken, so cycles started
/// by the scheduler never overlap. Ticks missed while a slow cycle runs are
/// dropped rather than run back to back.
pub struct BackupScheduler {
    orchestrator: BackupOrchestrator,
    interval: Duration,
    cycle_timeout: Duration,
    run_on_start: bool,
}

impl BackupScheduler {
    pub fn new(orchestrator: BackupOrchestrator, interval: Duration, cycle_timeout: Duration) -> Self {
        Self {
            orchestrator,
            // tokio intervals cannot have a zero period
            interval: interval.max(Duration::from_secs(1)),
            cycle_timeout,
            run_on_start: false,
        }
    }

    /// Run the first cycle immediately instead of after one interval
    pub fn run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    /// Tick until `shutdown` is cancelled. Returns the number of cycles started.
    pub async fn run(self, shutdown: CancellationToken) -> usize {
        let start = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Backup scheduler started for {} (every {:?})",
            self.orchestrator.destination().display(),
            self.interval
        );

        let mut cycles = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    cycles += 1;
                    if self.orchestrator.run_cycle_with_timeout(self.cycle_timeout).await.is_none() {
                        warn!("Scheduled backup cycle did not complete in time");
                    }
                }
            }
        }

        info!("Backup scheduler stopped after {} cycle(s)", cycles);
        cycles
    }
}
