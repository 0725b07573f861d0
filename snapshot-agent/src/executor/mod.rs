//! Backup orchestrator - runs one prune-then-write cycle.
//!
//! A cycle never fails from the caller's point of view: every step's result
//! lands in a [`BackupOutcome`] that is returned and handed to the configured
//! [`OutcomeSink`]. Retrying is left to the next trigger.

pub mod locks;
pub mod outcome;

use crate::archive::naming::archive_name;
use crate::archive::ArchiveWriter;
use crate::config::{BackupConfig, SourceEntry};
use crate::retention;
use crate::utils::errors::SnapshotError;
use chrono::{Local, NaiveDateTime};
use locks::DestinationLocks;
use outcome::{BackupOutcome, OutcomeSink, TracingSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Everything a cycle needs, shared with the blocking worker
struct CycleContext {
    destination: PathBuf,
    max_backups: usize,
    sources: Vec<SourceEntry>,
    writer: ArchiveWriter,
}

/// Main backup orchestrator
#[derive(Clone)]
pub struct BackupOrchestrator {
    context: Arc<CycleContext>,
    sink: Arc<dyn OutcomeSink>,
    locks: DestinationLocks,
}

impl BackupOrchestrator {
    /// Create an orchestrator that reports to `tracing` and shares the
    /// process-wide destination locks.
    pub fn new(backup: &BackupConfig, sources: Vec<SourceEntry>) -> Self {
        Self {
            context: Arc::new(CycleContext {
                destination: backup.destination_dir.clone(),
                max_backups: backup.max_backups.max(1),
                sources,
                writer: ArchiveWriter::from_config(backup),
            }),
            sink: Arc::new(TracingSink),
            locks: DestinationLocks::global(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_locks(mut self, locks: DestinationLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.context.destination
    }

    /// Run one cycle stamped with the current local time.
    ///
    /// Waits for any other cycle on the same destination, then does the file
    /// work on the blocking thread pool.
    pub async fn run_cycle(&self) -> BackupOutcome {
        let _guard = self.locks.acquire(&self.context.destination).await;

        let context = self.context.clone();
        let now = Local::now().naive_local();
        let outcome = match tokio::task::spawn_blocking(move || context.run_at(now)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Backup cycle task failed: {}", e);
                BackupOutcome {
                    destination: self.context.destination.clone(),
                    started_at: Some(now),
                    write_error: Some(format!("backup cycle task failed: {}", e)),
                    ..Default::default()
                }
            }
        };

        self.sink.report(&outcome);
        outcome
    }

    /// Like [`run_cycle`](Self::run_cycle), but stop waiting after `timeout`.
    ///
    /// Returns `None` if the cycle did not finish in time. The cycle itself
    /// keeps running in the background and reports its outcome when done.
    pub async fn run_cycle_with_timeout(&self, timeout: Duration) -> Option<BackupOutcome> {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_cycle().await });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                error!("Backup cycle task failed: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Backup cycle for {} still running after {:?}, no longer waiting",
                    self.context.destination.display(),
                    timeout
                );
                None
            }
        }
    }

    /// Run one cycle on the current thread as if it were `now`.
    ///
    /// Takes no lock; callers must not overlap cycles on the same destination.
    pub fn run_blocking_at(&self, now: NaiveDateTime) -> BackupOutcome {
        let outcome = self.context.run_at(now);
        self.sink.report(&outcome);
        outcome
    }
}

impl CycleContext {
    fn run_at(&self, now: NaiveDateTime) -> BackupOutcome {
        let mut outcome = BackupOutcome {
            destination: self.destination.clone(),
            started_at: Some(now),
            ..Default::default()
        };

        match retention::remove_stale_partials(&self.destination) {
            Ok(removed) => outcome.removed_partials = removed,
            Err(e) => debug!("Could not sweep {}: {}", self.destination.display(), e),
        }

        let name = archive_name(now);
        let target = self.destination.join(&name);
        let exists = target.symlink_metadata().is_ok();

        // Leave room for the archive about to be written
        let keep = if exists {
            self.max_backups
        } else {
            self.max_backups - 1
        };
        self.prune(keep, &mut outcome);

        if exists {
            debug!("Archive {} already exists, skipping write", name);
            outcome.skipped = true;
            return outcome;
        }

        self.write(&target, &mut outcome);
        outcome
    }

    fn prune(&self, keep: usize, outcome: &mut BackupOutcome) {
        match retention::prune(&self.destination, keep) {
            Ok(report) => {
                outcome.pruned = report.pruned();
                outcome.prune_errors = report.failures.iter().map(ToString::to_string).collect();
                outcome.pruned_names = report.deleted;
            }
            Err(e) => outcome.prune_errors.push(e.to_string()),
        }
    }

    fn write(&self, target: &Path, outcome: &mut BackupOutcome) {
        if let Err(e) = std::fs::create_dir_all(&self.destination) {
            outcome.write_error = Some(SnapshotError::write_failure(&self.destination, e).to_string());
            return;
        }

        match self.writer.write_archive(target, &self.sources) {
            Ok(report) => {
                outcome.created = Some(target.to_path_buf());
                outcome.entries_written = report.entries_written;
                outcome.bytes_written = report.bytes_written;
                outcome.unavailable_sources = report.unavailable;
            }
            // Another writer created it after the existence check
            Err(SnapshotError::AlreadyExists(_)) => outcome.skipped = true,
            Err(e) => outcome.write_error = Some(e.to_string()),
        }
    }
}
