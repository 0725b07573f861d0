//! Cycle outcome record and the sinks it is reported to.

use crate::fs::sources::UnavailableSource;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything one backup cycle did. Failures are recorded here instead of
/// being returned as errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupOutcome {
    pub destination: PathBuf,
    pub started_at: Option<NaiveDateTime>,

    /// Number of old archives deleted by the prune step
    pub pruned: usize,
    pub pruned_names: Vec<String>,
    pub prune_errors: Vec<String>,

    /// Temporary files of interrupted writes that were removed
    pub removed_partials: Vec<String>,

    /// Archive written by this cycle
    pub created: Option<PathBuf>,

    /// The archive for this minute already existed
    pub skipped: bool,

    pub entries_written: usize,
    pub bytes_written: u64,
    pub unavailable_sources: Vec<UnavailableSource>,
    pub write_error: Option<String>,
}

impl BackupOutcome {
    /// True when no step failed. A same-minute skip counts as success.
    pub fn is_success(&self) -> bool {
        self.write_error.is_none() && self.prune_errors.is_empty()
    }
}

/// Receives the outcome of every cycle.
pub trait OutcomeSink: Send + Sync {
    fn report(&self, outcome: &BackupOutcome);
}

/// Logs outcomes through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutcomeSink for TracingSink {
    fn report(&self, outcome: &BackupOutcome) {
        let destination = outcome.destination.display();

        for e in &outcome.prune_errors {
            warn!(destination = %destination, error = %e, "Could not delete an old backup");
        }
        for source in &outcome.unavailable_sources {
            warn!(destination = %destination, source = %source, "Source missing from backup");
        }

        if let Some(e) = &outcome.write_error {
            error!(destination = %destination, error = %e, "An error occurred while creating a backup");
        } else if let Some(created) = &outcome.created {
            info!(
                archive = %created.display(),
                entries = outcome.entries_written,
                bytes = outcome.bytes_written,
                pruned = outcome.pruned,
                "Backed up data"
            );
        } else if outcome.skipped {
            info!(destination = %destination, pruned = outcome.pruned, "Backup for this minute already exists, skipping");
        }
    }
}

/// Appends each outcome as one JSON line to a file
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, outcome: &BackupOutcome) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(outcome)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

impl OutcomeSink for JsonLinesSink {
    fn report(&self, outcome: &BackupOutcome) {
        if let Err(e) = self.append(outcome) {
            warn!("Failed to write outcome to {}: {}", self.path.display(), e);
        }
    }
}

/// Forwards every outcome to several sinks
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn OutcomeSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl OutcomeSink for FanoutSink {
    fn report(&self, outcome: &BackupOutcome) {
        for sink in &self.sinks {
            sink.report(outcome);
        }
    }
}

/// Keeps every outcome in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CollectingSink {
    outcomes: std::sync::Mutex<Vec<BackupOutcome>>,
}

#[cfg(test)]
impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<BackupOutcome> {
        self.outcomes
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl OutcomeSink for CollectingSink {
    fn report(&self, outcome: &BackupOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(outcome.clone());
        }
    }
}
