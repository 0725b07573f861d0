//! Bounded-count retention of archives in a destination directory.
//!
//! Only files whose name parses as an archive timestamp take part. Anything
//! else in the directory is neither counted nor deleted, with one exception:
//! temporary `.<archive>.partial` files left by an interrupted write can be
//! swept with [`remove_stale_partials`].

use crate::archive::naming::{parse_archive_name, parse_partial_name, BackupArchive};
use crate::utils::errors::{PruneFailure, Result, SnapshotError};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info, warn};

/// What a prune pass did
#[derive(Debug, Default, Clone, Serialize)]
pub struct PruneReport {
    /// Names of archives that were deleted, oldest first
    pub deleted: Vec<String>,

    /// Archives that should have been deleted but could not be
    pub failures: Vec<PruneFailure>,

    /// Archives remaining after the pass
    pub retained: usize,
}

impl PruneReport {
    pub fn pruned(&self) -> usize {
        self.deleted.len()
    }

    /// Aggregated non-fatal error for the deletions that failed, if any.
    pub fn error(&self) -> Option<SnapshotError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(SnapshotError::PruneFailure(self.failures.clone()))
        }
    }
}

/// List the archives in `directory`, newest first.
///
/// A directory that does not exist yet holds no archives.
pub fn list_archives(directory: &Path) -> Result<Vec<BackupArchive>> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut archives: Vec<BackupArchive> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            let created_at = parse_archive_name(&name)?;
            Some(BackupArchive {
                name,
                created_at,
                path: e.path(),
            })
        })
        .collect();

    archives.sort_by(BackupArchive::newest_first);
    Ok(archives)
}

/// Delete the oldest archives in `directory` until at most `max_backups` remain.
///
/// A file that cannot be deleted is recorded in the report and the pass
/// moves on to the next candidate. Only a failure to list the directory
/// is returned as an error.
pub fn prune(directory: &Path, max_backups: usize) -> Result<PruneReport> {
    let archives = list_archives(directory)?;

    if archives.len() <= max_backups {
        debug!(
            "{} archive(s) in {}, nothing to prune (max {})",
            archives.len(),
            directory.display(),
            max_backups
        );
        return Ok(PruneReport {
            retained: archives.len(),
            ..Default::default()
        });
    }

    let excess = archives.len() - max_backups;
    let candidates = &archives[max_backups..];
    debug_assert_eq!(candidates.len(), excess);

    let mut report = delete_archives(candidates.iter().rev());
    report.retained = archives.len() - report.deleted.len();

    info!(
        "Pruned {} of {} old archive(s) in {} ({} retained)",
        report.deleted.len(),
        excess,
        directory.display(),
        report.retained
    );
    if let Some(e) = report.error() {
        warn!("{}", e);
    }

    Ok(report)
}

/// Delete temporary archives that an interrupted write left in `directory`.
///
/// Only call this while no cycle is writing to the same directory, or a
/// write in progress loses its file. Returns the names removed.
pub fn remove_stale_partials(directory: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut removed = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if parse_partial_name(&name).is_none() {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                warn!("Removed unfinished archive {} from {}", name, directory.display());
                removed.push(name);
            }
            Err(e) => warn!("Could not remove unfinished archive {}: {}", name, e),
        }
    }

    Ok(removed)
}

/// Delete each archive, collecting failures instead of stopping at the first.
fn delete_archives<'a>(archives: impl Iterator<Item = &'a BackupArchive>) -> PruneReport {
    let mut report = PruneReport::default();

    for archive in archives {
        match std::fs::remove_file(&archive.path) {
            Ok(()) => {
                info!("Deleted old archive {}", archive.name);
                report.deleted.push(archive.name.clone());
            }
            Err(e) => {
                debug!("Could not delete old archive {}: {}", archive.name, e);
                report.failures.push(PruneFailure {
                    name: archive.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    report
}
