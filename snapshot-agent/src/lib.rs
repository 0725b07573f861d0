//! Snapshot Agent Library
//!
//! Captures a configured set of data directories into one timestamped ZIP
//! archive per cycle and keeps only the most recent archives.
//!
//! ```no_run
//! use snapshot_agent::{BackupOrchestrator, Config};
//! use std::path::Path;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::from_file(Path::new("snapshot-agent.toml"))?;
//! let orchestrator = BackupOrchestrator::new(&config.backup, config.sources.clone());
//! let outcome = orchestrator.run_cycle().await;
//! println!("created: {:?}, pruned: {}", outcome.created, outcome.pruned);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod retention;
pub mod utils;

// Re-export commonly used types
pub use archive::naming::{archive_name, parse_archive_name, BackupArchive};
pub use archive::{ArchiveReport, ArchiveWriter};
pub use config::{Config, SourceEntry, SourceKind};
pub use executor::outcome::{BackupOutcome, OutcomeSink};
pub use executor::BackupOrchestrator;
pub use retention::{list_archives, prune, remove_stale_partials, PruneReport};
pub use utils::errors::{Result, SnapshotError};
