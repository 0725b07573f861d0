//! Configuration management for the snapshot agent.
//!
//! Loads configuration from a TOML file. Every section except `[[sources]]`
//! has defaults, so a minimal file only names what to back up and where.

use crate::utils::errors::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub sources: Vec<SourceEntry>,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory the timestamped archives are written to
    #[serde(default = "default_destination_dir")]
    pub destination_dir: PathBuf,

    /// Maximum number of archives kept in the destination directory
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Compression method for archive entries
    #[serde(default)]
    pub compression: Compression,

    /// Compression level (method specific, None = library default)
    #[serde(default)]
    pub compression_level: Option<i64>,

    /// Copy buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Stored,
    #[default]
    Deflate,
    Zstd,
}

/// One configured item to include in every archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// File or directory on disk
    pub path: PathBuf,

    #[serde(default)]
    pub kind: SourceKind,

    /// Logical name inside the archive. For a file this is the full entry
    /// name; for directories it is the prefix of every contained entry.
    pub prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    /// Immediate files of the directory, one level deep
    #[default]
    Directory,
    /// Each immediate subdirectory expanded as a `Directory` under `<prefix>/<name>`
    Nested,
}

impl SourceEntry {
    pub fn file(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::File,
            prefix: name.into(),
        }
    }

    pub fn directory(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::Directory,
            prefix: prefix.into(),
        }
    }

    pub fn nested(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::Nested,
            prefix: prefix.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between periodic cycles (0 = no periodic trigger)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Run a cycle immediately at startup
    #[serde(default)]
    pub run_on_start: bool,

    /// Run a final cycle when the process receives a shutdown signal
    #[serde(default = "default_true")]
    pub run_on_shutdown: bool,

    /// Seconds to wait for a cycle before giving up on it
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append one JSON line per cycle outcome to this file
    #[serde(default)]
    pub outcome_file: Option<PathBuf>,
}

// Default values
fn default_destination_dir() -> PathBuf {
    PathBuf::from("data-storage/backups")
}

fn default_max_backups() -> usize {
    20
}

fn default_buffer_size() -> usize {
    8 * 1024
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_cycle_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            destination_dir: default_destination_dir(),
            max_backups: default_max_backups(),
            compression: Compression::default(),
            compression_level: None,
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            run_on_start: false,
            run_on_shutdown: true,
            cycle_timeout_secs: default_cycle_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            outcome_file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backup: BackupConfig::default(),
            sources: Vec::new(),
            schedule: ScheduleConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.backup.destination_dir.as_os_str().is_empty() {
            return Err(SnapshotError::Config(
                "backup.destination_dir must not be empty".to_string(),
            ));
        }
        if self.backup.max_backups == 0 {
            return Err(SnapshotError::Config(
                "backup.max_backups must be at least 1".to_string(),
            ));
        }
        if self.backup.buffer_size == 0 {
            return Err(SnapshotError::Config(
                "backup.buffer_size must be at least 1".to_string(),
            ));
        }
        if self.schedule.cycle_timeout_secs == 0 {
            return Err(SnapshotError::Config(
                "schedule.cycle_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.sources.is_empty() {
            return Err(SnapshotError::Config(
                "at least one [[sources]] entry is required".to_string(),
            ));
        }
        for source in &self.sources {
            if source.kind == SourceKind::File && source.prefix.trim_matches('/').is_empty() {
                return Err(SnapshotError::Config(format!(
                    "file source {} needs an entry name",
                    source.path.display()
                )));
            }
        }
        self.check_destination_outside_sources()?;
        Ok(())
    }

    /// An archive written inside a directory source would be copied into
    /// the next archive, and so on.
    fn check_destination_outside_sources(&self) -> Result<()> {
        let destination = normalized(&self.backup.destination_dir);

        for source in &self.sources {
            if source.kind == SourceKind::File {
                continue;
            }
            if destination.starts_with(normalized(&source.path)) {
                return Err(SnapshotError::Config(format!(
                    "backup.destination_dir {} lies inside source {}",
                    self.backup.destination_dir.display(),
                    source.path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Absolute form of `path` for containment checks. The deepest existing
/// ancestor is canonicalized so symlinks resolve; the rest is lexical.
fn normalized(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }

    let mut existing = lexical.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            return missing.iter().rev().fold(canonical, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return lexical,
        }
    }
}
