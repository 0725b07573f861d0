//! Custom error types for the snapshot agent.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Archive already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Failed to write archive {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete {} old archive(s): {}", .0.len(), join_failures(.0))]
    PruneFailure(Vec<PruneFailure>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotError {
    pub fn write_failure(path: &Path, source: std::io::Error) -> Self {
        SnapshotError::WriteFailure {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A single archive that could not be deleted during pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneFailure {
    pub name: String,
    pub reason: String,
}

impl std::fmt::Display for PruneFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.reason)
    }
}

fn join_failures(failures: &[PruneFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
