//! Archive writer - streams source files into a single ZIP container.
//!
//! The archive is written under a hidden temporary name that retention never
//! matches, synced, and only then linked to its final name. A file carrying
//! an archive name is therefore always a complete archive, even if the
//! process dies mid-write. Publishing never replaces an existing archive.

pub mod naming;

use crate::config::{BackupConfig, Compression, SourceEntry};
use crate::fs::sources::{expand_sources, ArchiveItem, UnavailableSource};
use crate::utils::errors::{Result, SnapshotError};
use chrono::{DateTime, Datelike, Local, Timelike};
use naming::partial_path;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Entries at or above this size need ZIP64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// What ended up in a completed archive
#[derive(Debug, Default, Clone, Serialize)]
pub struct ArchiveReport {
    pub entries_written: usize,
    pub bytes_written: u64,
    pub unavailable: Vec<UnavailableSource>,
}

/// Writes source entries into a ZIP archive
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    compression: Compression,
    compression_level: Option<i64>,
    buffer_size: usize,
}

/// Outcome of copying one source file into the open archive
enum CopyOutcome {
    Written(u64),
    SourceFailed(io::Error),
}

impl ArchiveWriter {
    pub fn new(compression: Compression, compression_level: Option<i64>, buffer_size: usize) -> Self {
        Self {
            compression,
            compression_level,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(config.compression, config.compression_level, config.buffer_size)
    }

    /// Write every source into a new archive at `destination`.
    ///
    /// # Errors
    /// * `AlreadyExists` - `destination` is already present; it is left untouched
    /// * `WriteFailure` - the archive could not be created or written; no file
    ///   is left at `destination` or at its temporary name
    ///
    /// Sources that are missing or unreadable are listed in the report rather
    /// than failing the archive.
    pub fn write_archive(&self, destination: &Path, sources: &[SourceEntry]) -> Result<ArchiveReport> {
        if destination.symlink_metadata().is_ok() {
            return Err(SnapshotError::AlreadyExists(destination.to_path_buf()));
        }

        let partial = partial_path(destination)
            .ok_or_else(|| SnapshotError::Config(format!("invalid archive path {}", destination.display())))?;

        // Left behind by a write that never finished
        match std::fs::remove_file(&partial) {
            Ok(()) => warn!("Removed stale partial archive {}", partial.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(SnapshotError::write_failure(&partial, e)),
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .map_err(|e| SnapshotError::write_failure(&partial, e))?;

        let report = self.write_into(&partial, file, sources)?;
        publish(&partial, destination)?;

        info!(
            "Created archive {} ({} entries, {} bytes, {} unavailable)",
            destination.display(),
            report.entries_written,
            report.bytes_written,
            report.unavailable.len()
        );

        Ok(report)
    }

    /// Stream the sources into `sink`, which is the file at `partial`.
    /// On any write error the file at `partial` is removed.
    fn write_into<W: SyncSink>(
        &self,
        partial: &Path,
        sink: W,
        sources: &[SourceEntry],
    ) -> Result<ArchiveReport> {
        let guard = PartialArchive::new(partial);

        let expansion = expand_sources(sources);
        let mut report = ArchiveReport {
            unavailable: expansion.unavailable,
            ..Default::default()
        };

        let mut sink = self
            .write_items(sink, &expansion.items, &mut report)
            .map_err(|e| SnapshotError::write_failure(partial, e))?;
        sink.sync()
            .map_err(|e| SnapshotError::write_failure(partial, e))?;
        drop(sink);

        guard.keep();
        Ok(report)
    }

    fn write_items<W: Write + Seek>(
        &self,
        sink: W,
        items: &[ArchiveItem],
        report: &mut ArchiveReport,
    ) -> io::Result<W> {
        let mut zip = ZipWriter::new(sink);
        let mut buffer = vec![0u8; self.buffer_size];
        let mut seen = HashSet::new();

        for item in items {
            if !seen.insert(item.entry_name.as_str()) {
                warn!("Skipping {}: duplicate entry name {}", item.path.display(), item.entry_name);
                report.unavailable.push(UnavailableSource {
                    path: item.path.clone(),
                    reason: format!("duplicate entry name {}", item.entry_name),
                });
                continue;
            }

            let mut source = match File::open(&item.path) {
                Ok(file) => file,
                Err(e) => {
                    record_unavailable(report, &item.path, &e);
                    continue;
                }
            };
            let metadata = match source.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    record_unavailable(report, &item.path, &e);
                    continue;
                }
            };

            let mut options = self.file_options();
            if metadata.len() >= ZIP64_THRESHOLD {
                options = options.large_file(true);
            }
            if let Some(mtime) = metadata.modified().ok().and_then(zip_time) {
                options = options.last_modified_time(mtime);
            }

            zip.start_file(item.entry_name.as_str(), options)
                .map_err(io::Error::other)?;

            match copy_entry(&mut source, &mut zip, &mut buffer)? {
                CopyOutcome::Written(bytes) => {
                    debug!("Added {} ({} bytes)", item.entry_name, bytes);
                    report.entries_written += 1;
                    report.bytes_written += bytes;
                }
                CopyOutcome::SourceFailed(e) => {
                    zip.abort_file().map_err(io::Error::other)?;
                    record_unavailable(report, &item.path, &e);
                }
            }
        }

        zip.finish().map_err(io::Error::other)
    }

    fn file_options(&self) -> SimpleFileOptions {
        let method = match self.compression {
            Compression::Stored => CompressionMethod::Stored,
            Compression::Deflate => CompressionMethod::Deflated,
            Compression::Zstd => CompressionMethod::Zstd,
        };

        SimpleFileOptions::default()
            .compression_method(method)
            .compression_level(self.compression_level)
    }
}

/// Copy `source` into the current entry through `buffer`.
///
/// Read errors belong to the source and are returned as `SourceFailed`;
/// write errors belong to the archive and are propagated.
fn copy_entry<R: Read, W: Write>(source: &mut R, zip: &mut W, buffer: &mut [u8]) -> io::Result<CopyOutcome> {
    let mut total = 0u64;

    loop {
        let read = match source.read(buffer) {
            Ok(0) => return Ok(CopyOutcome::Written(total)),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Ok(CopyOutcome::SourceFailed(e)),
        };

        zip.write_all(&buffer[..read])?;
        total += read as u64;
    }
}

/// Give the completed archive at `partial` its final name without replacing
/// anything already at `destination`. The partial file is gone afterwards.
fn publish(partial: &Path, destination: &Path) -> Result<()> {
    let guard = PartialArchive::new(partial);

    match std::fs::hard_link(partial, destination) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(SnapshotError::AlreadyExists(destination.to_path_buf()));
        }
        // File systems without hard links; callers hold the destination lock
        Err(e) => {
            debug!("Hard link to {} failed ({}), renaming instead", destination.display(), e);
            if destination.symlink_metadata().is_ok() {
                return Err(SnapshotError::AlreadyExists(destination.to_path_buf()));
            }
            std::fs::rename(partial, destination)
                .map_err(|e| SnapshotError::write_failure(destination, e))?;
        }
    }

    // Removes the temporary link, or finds nothing after a rename
    drop(guard);
    sync_dir(destination);
    Ok(())
}

/// Persist the new directory entry. Best effort: not every platform can
/// open a directory for syncing.
fn sync_dir(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!("Could not sync directory {}: {}", dir.display(), e);
        }
    }
}

fn record_unavailable(report: &mut ArchiveReport, path: &Path, e: &io::Error) {
    warn!("Skipping unreadable source {}: {}", path.display(), e);
    report.unavailable.push(UnavailableSource {
        path: path.to_path_buf(),
        reason: e.to_string(),
    });
}

/// Local modification time as a ZIP timestamp (ZIP cannot store years before 1980).
fn zip_time(modified: std::time::SystemTime) -> Option<zip::DateTime> {
    let local: DateTime<Local> = modified.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(local.year()).ok()?,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .ok()
}

/// Destination of an archive that can be flushed to stable storage
trait SyncSink: Write + Seek {
    fn sync(&mut self) -> io::Result<()>;
}

impl SyncSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Removes the temporary archive file on drop unless told to keep it.
struct PartialArchive {
    path: Option<PathBuf>,
}

impl PartialArchive {
    fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    fn keep(mut self) {
        self.path = None;
    }
}

impl Drop for PartialArchive {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed temporary archive {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove temporary archive {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn writer() -> ArchiveWriter {
        ArchiveWriter::new(Compression::Deflate, None, 1024)
    }

    fn read_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entries = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.push((entry.name().to_string(), data));
        }
        entries.sort();
        entries
    }

    /// Accepts `limit` bytes, then fails like a full disk
    struct FailingSink {
        inner: Cursor<Vec<u8>>,
        limit: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.inner.get_ref().len() + buf.len() > self.limit {
                return Err(io::Error::new(ErrorKind::Other, "No space left on device"));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingSink {
        fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl SyncSink for FailingSink {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_archive_with_prefixes() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let inv = temp_dir.path().join("universal-inventories");
        fs::create_dir(&inv)?;
        fs::write(inv.join("1.sfi"), b"first")?;
        fs::write(inv.join("2.sfi"), b"second")?;
        let chunks = temp_dir.path().join("chunks.sfc");
        fs::write(&chunks, b"chunk-data")?;

        let dest = temp_dir.path().join("2024-03-07-22-15.zip");
        let report = writer()
            .write_archive(
                &dest,
                &[
                    SourceEntry::directory(&inv, "universal-inventories"),
                    SourceEntry::file(&chunks, "stored-chunks/chunks.sfc"),
                ],
            )
            .unwrap();

        assert_eq!(report.entries_written, 3);
        assert_eq!(report.bytes_written, 21);
        assert!(report.unavailable.is_empty());
        assert_eq!(
            read_entries(&dest),
            vec![
                ("stored-chunks/chunks.sfc".to_string(), b"chunk-data".to_vec()),
                ("universal-inventories/1.sfi".to_string(), b"first".to_vec()),
                ("universal-inventories/2.sfi".to_string(), b"second".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_small_buffer_streams_large_file() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let source = temp_dir.path().join("big.bin");
        fs::write(&source, &data)?;

        let dest = temp_dir.path().join("out.zip");
        ArchiveWriter::new(Compression::Stored, None, 7)
            .write_archive(&dest, &[SourceEntry::file(&source, "big.bin")])
            .unwrap();

        let entries = read_entries(&dest);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, data);
        Ok(())
    }

    #[test]
    fn test_zstd_archive_readable() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"zstd compressed payload")?;

        let dest = temp_dir.path().join("out.zip");
        ArchiveWriter::new(Compression::Zstd, Some(3), 1024)
            .write_archive(&dest, &[SourceEntry::file(&source, "a.txt")])
            .unwrap();

        assert_eq!(read_entries(&dest)[0].1, b"zstd compressed payload".to_vec());
        Ok(())
    }

    #[test]
    fn test_missing_source_does_not_abort_archive() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let present = temp_dir.path().join("present");
        fs::create_dir(&present)?;
        fs::write(present.join("keep.dat"), b"keep")?;

        let dest = temp_dir.path().join("out.zip");
        let report = writer()
            .write_archive(
                &dest,
                &[
                    SourceEntry::directory(temp_dir.path().join("missing"), "missing"),
                    SourceEntry::directory(&present, "present"),
                ],
            )
            .unwrap();

        assert_eq!(report.entries_written, 1);
        assert_eq!(report.unavailable.len(), 1);
        assert_eq!(report.unavailable[0].path, temp_dir.path().join("missing"));
        assert_eq!(
            read_entries(&dest),
            vec![("present/keep.dat".to_string(), b"keep".to_vec())]
        );
        Ok(())
    }

    #[test]
    fn test_existing_destination_is_not_overwritten() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"new")?;
        let dest = temp_dir.path().join("2024-03-07-22-15.zip");
        fs::write(&dest, b"previous archive")?;

        let result = writer().write_archive(&dest, &[SourceEntry::file(&source, "a.txt")]);

        assert!(matches!(result, Err(SnapshotError::AlreadyExists(_))));
        assert_eq!(fs::read(&dest)?, b"previous archive");
        Ok(())
    }

    #[test]
    fn test_unwritable_destination_leaves_nothing() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"data")?;
        let dest = temp_dir.path().join("no-such-dir").join("out.zip");

        let result = writer().write_archive(&dest, &[SourceEntry::file(&source, "a.txt")]);

        assert!(matches!(result, Err(SnapshotError::WriteFailure { .. })));
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn test_failed_write_removes_partial_archive() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.bin");
        fs::write(&source, vec![7u8; 64 * 1024])?;

        let dest = temp_dir.path().join("2024-03-07-22-15.zip");
        let partial = partial_path(&dest).unwrap();
        fs::write(&partial, b"")?;

        let sink = FailingSink {
            inner: Cursor::new(Vec::new()),
            limit: 512,
        };
        let result = ArchiveWriter::new(Compression::Stored, None, 1024).write_into(
            &partial,
            sink,
            &[SourceEntry::file(&source, "a.bin")],
        );

        match result {
            Err(SnapshotError::WriteFailure { path, source }) => {
                assert_eq!(path, partial);
                assert!(source.to_string().contains("No space left"));
            }
            other => panic!("expected WriteFailure, got {:?}", other),
        }
        assert!(!partial.exists());
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn test_archive_is_not_listed_until_published() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"payload")?;

        let dest = temp_dir.path().join("2024-03-07-22-15.zip");
        let partial = partial_path(&dest).unwrap();
        let file = OpenOptions::new().write(true).create_new(true).open(&partial)?;

        writer()
            .write_into(&partial, file, &[SourceEntry::file(&source, "a.txt")])
            .unwrap();

        // Written and synced but not yet renamed: a crash here leaves no archive
        assert!(partial.exists());
        assert!(!dest.exists());
        assert!(crate::retention::list_archives(temp_dir.path()).unwrap().is_empty());

        publish(&partial, &dest).unwrap();

        assert!(!partial.exists());
        assert_eq!(crate::retention::list_archives(temp_dir.path()).unwrap().len(), 1);
        assert_eq!(read_entries(&dest), vec![("a.txt".to_string(), b"payload".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_stale_partial_is_replaced() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"fresh")?;

        let dest = temp_dir.path().join("2024-03-07-22-15.zip");
        let partial = partial_path(&dest).unwrap();
        fs::write(&partial, b"PK\x03\x04 truncated")?;

        let report = writer()
            .write_archive(&dest, &[SourceEntry::file(&source, "a.txt")])
            .unwrap();

        assert_eq!(report.entries_written, 1);
        assert!(!partial.exists());
        assert_eq!(read_entries(&dest), vec![("a.txt".to_string(), b"fresh".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_publish_never_replaces_existing_archive() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let dest = temp_dir.path().join("2024-03-07-22-15.zip");
        fs::write(&dest, b"previous archive")?;
        let partial = partial_path(&dest).unwrap();
        fs::write(&partial, b"newer archive")?;

        let result = publish(&partial, &dest);

        assert!(matches!(result, Err(SnapshotError::AlreadyExists(_))));
        assert_eq!(fs::read(&dest)?, b"previous archive");
        assert!(!partial.exists());
        Ok(())
    }

    #[test]
    fn test_write_items_records_missing_item() {
        let temp_dir = TempDir::new().unwrap();
        let present = temp_dir.path().join("present.txt");
        fs::write(&present, b"here").unwrap();
        let gone = temp_dir.path().join("gone.txt");

        // Removed between expansion and opening
        let items = vec![
            ArchiveItem {
                path: gone.clone(),
                entry_name: "gone.txt".to_string(),
            },
            ArchiveItem {
                path: present,
                entry_name: "present.txt".to_string(),
            },
        ];

        let mut report = ArchiveReport::default();
        let cursor = writer()
            .write_items(Cursor::new(Vec::new()), &items, &mut report)
            .unwrap();

        assert_eq!(report.entries_written, 1);
        assert_eq!(report.unavailable.len(), 1);
        assert_eq!(report.unavailable[0].path, gone);

        let mut archive = ZipArchive::new(cursor).unwrap();
        assert_eq!(archive.len(), 1);
        let mut data = Vec::new();
        archive.by_name("present.txt").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"here");
    }

    /// Yields `remaining` bytes, then fails like a vanished network share
    struct FailingReader {
        remaining: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(ErrorKind::Other, "Input/output error"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(0xAB);
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_source_read_failure_aborts_only_that_entry() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let mut buffer = vec![0u8; 16];
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        zip.start_file("broken.bin", options).unwrap();
        let outcome = copy_entry(&mut FailingReader { remaining: 40 }, &mut zip, &mut buffer).unwrap();
        match outcome {
            CopyOutcome::SourceFailed(e) => assert!(e.to_string().contains("Input/output")),
            CopyOutcome::Written(n) => panic!("expected a source failure, wrote {n} bytes"),
        }
        zip.abort_file().unwrap();

        zip.start_file("good.txt", options).unwrap();
        let outcome = copy_entry(&mut &b"intact"[..], &mut zip, &mut buffer).unwrap();
        assert!(matches!(outcome, CopyOutcome::Written(6)));

        let mut archive = ZipArchive::new(zip.finish().unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        let mut data = Vec::new();
        archive.by_name("good.txt").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"intact");
    }

    #[test]
    fn test_duplicate_entry_names_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let first = temp_dir.path().join("first.txt");
        let second = temp_dir.path().join("second.txt");
        fs::write(&first, b"first")?;
        fs::write(&second, b"second")?;

        let dest = temp_dir.path().join("out.zip");
        let report = writer()
            .write_archive(
                &dest,
                &[
                    SourceEntry::file(&first, "same.txt"),
                    SourceEntry::file(&second, "same.txt"),
                ],
            )
            .unwrap();

        assert_eq!(report.entries_written, 1);
        assert_eq!(report.unavailable.len(), 1);
        assert_eq!(read_entries(&dest), vec![("same.txt".to_string(), b"first".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_empty_source_list_produces_valid_archive() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let dest = temp_dir.path().join("out.zip");

        let report = writer().write_archive(&dest, &[]).unwrap();

        assert_eq!(report.entries_written, 0);
        assert!(read_entries(&dest).is_empty());
        assert_eq!(fs::read_dir(temp_dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_zip_time_rejects_pre_1980() {
        assert!(zip_time(std::time::UNIX_EPOCH).is_none());
        assert!(zip_time(std::time::SystemTime::now()).is_some());
    }
}
