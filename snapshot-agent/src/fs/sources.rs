//! Expansion of configured sources into archive items.
//!
//! A directory source contributes its immediate files only. Sources are
//! read while the owning process may still be writing to them, so anything
//! that disappears or cannot be read is reported and skipped instead of
//! failing the whole expansion.

use crate::config::{SourceEntry, SourceKind};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// One file to be written into the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveItem {
    /// Full path to the file on disk
    pub path: PathBuf,

    /// Forward-slash entry name inside the archive
    pub entry_name: String,
}

/// A source (or part of one) that could not be included
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnavailableSource {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for UnavailableSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Result of expanding a list of sources
#[derive(Debug, Default)]
pub struct Expansion {
    pub items: Vec<ArchiveItem>,
    pub unavailable: Vec<UnavailableSource>,
}

impl Expansion {
    fn unavailable(&mut self, path: &Path, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Skipping unavailable source {}: {}", path.display(), reason);
        self.unavailable.push(UnavailableSource {
            path: path.to_path_buf(),
            reason,
        });
    }
}

/// Expand every source, in configuration order.
pub fn expand_sources(sources: &[SourceEntry]) -> Expansion {
    let mut expansion = Expansion::default();

    for source in sources {
        match source.kind {
            SourceKind::File => expand_file(source, &mut expansion),
            SourceKind::Directory => {
                expand_directory(&source.path, &normalize_prefix(&source.prefix), &mut expansion)
            }
            SourceKind::Nested => expand_nested(source, &mut expansion),
        }
    }

    expansion
}

/// Join a logical prefix and a child name with a forward slash.
pub fn entry_name(prefix: &str, child: &str) -> String {
    if prefix.is_empty() {
        child.to_string()
    } else {
        format!("{}/{}", prefix, child)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.replace('\\', "/").trim_matches('/').to_string()
}

fn expand_file(source: &SourceEntry, expansion: &mut Expansion) {
    match std::fs::metadata(&source.path) {
        Ok(metadata) if metadata.is_file() => expansion.items.push(ArchiveItem {
            path: source.path.clone(),
            entry_name: normalize_prefix(&source.prefix),
        }),
        Ok(_) => expansion.unavailable(&source.path, "not a regular file"),
        Err(e) => expansion.unavailable(&source.path, describe(&e)),
    }
}

fn expand_nested(source: &SourceEntry, expansion: &mut Expansion) {
    let prefix = normalize_prefix(&source.prefix);

    let children = match immediate_children(&source.path) {
        Ok(children) => children,
        Err(e) => {
            expansion.unavailable(&source.path, e);
            return;
        }
    };

    for child in children {
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                expansion.unavailable(&source.path, e.to_string());
                continue;
            }
        };

        if resolves_to_dir(&child) {
            let name = child.file_name().to_string_lossy();
            expand_directory(child.path(), &entry_name(&prefix, &name), expansion);
        }
    }
}

fn expand_directory(dir: &Path, prefix: &str, expansion: &mut Expansion) {
    let children = match immediate_children(dir) {
        Ok(children) => children,
        Err(e) => {
            expansion.unavailable(dir, e);
            return;
        }
    };

    for child in children {
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                // Entry vanished between listing and stat
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                expansion.unavailable(&path, e.to_string());
                continue;
            }
        };

        if !resolves_to_file(&child) {
            debug!("Skipping non-file entry {}", child.path().display());
            continue;
        }

        let name = child.file_name().to_string_lossy();
        expansion.items.push(ArchiveItem {
            path: child.path().to_path_buf(),
            entry_name: entry_name(prefix, &name),
        });
    }
}

/// Immediate children of `dir`, or a reason why it cannot be listed.
fn immediate_children(
    dir: &Path,
) -> std::result::Result<impl Iterator<Item = walkdir::Result<DirEntry>>, String> {
    match std::fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return Err("not a directory".to_string()),
        Err(e) => return Err(describe(&e)),
    }

    Ok(WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter())
}

/// Regular files, and symlinks whose target is a regular file.
fn resolves_to_file(entry: &DirEntry) -> bool {
    if entry.file_type().is_symlink() {
        return std::fs::metadata(entry.path())
            .map(|m| m.is_file())
            .unwrap_or(false);
    }
    entry.file_type().is_file()
}

fn resolves_to_dir(entry: &DirEntry) -> bool {
    if entry.file_type().is_symlink() {
        return std::fs::metadata(entry.path())
            .map(|m| m.is_dir())
            .unwrap_or(false);
    }
    entry.file_type().is_dir()
}

fn describe(e: &std::io::Error) -> String {
    match e.kind() {
        ErrorKind::NotFound => "does not exist".to_string(),
        ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ => e.to_string(),
    }
}
