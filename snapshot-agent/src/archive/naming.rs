//! Archive file naming.
//!
//! An archive is named after the local minute it was created in,
//! `yyyy-MM-dd-HH-mm.zip`. The name is the only record of the creation
//! time, so it is also what retention sorts by.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// chrono format of the file stem
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// Extension of every archive
pub const ARCHIVE_EXTENSION: &str = ".zip";

/// Suffix of an archive that is still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

/// A completed archive found in the destination directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArchive {
    pub name: String,
    pub created_at: NaiveDateTime,
    pub path: PathBuf,
}

impl BackupArchive {
    /// Newest first; equal timestamps fall back to the name so the order is total.
    pub fn newest_first(a: &BackupArchive, b: &BackupArchive) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    }
}

/// File name for an archive created at `time`.
pub fn archive_name(time: NaiveDateTime) -> String {
    format!("{}{}", time.format(TIMESTAMP_FORMAT), ARCHIVE_EXTENSION)
}

/// Recover the creation minute from an archive file name.
///
/// Returns `None` for anything that is not exactly what [`archive_name`]
/// would produce, including zero-padding differences.
pub fn parse_archive_name(name: &str) -> Option<NaiveDateTime> {
    let stem = name.strip_suffix(ARCHIVE_EXTENSION)?;
    let time = NaiveDateTime::parse_from_str(stem, TIMESTAMP_FORMAT).ok()?;

    if time.format(TIMESTAMP_FORMAT).to_string() != stem {
        return None;
    }

    Some(time)
}

/// Temporary name an archive is written under before it is published,
/// `.<name>.partial` next to the final path.
pub fn partial_path(archive: &Path) -> Option<PathBuf> {
    let name = archive.file_name()?.to_str()?;
    Some(archive.with_file_name(format!(".{name}{PARTIAL_SUFFIX}")))
}

/// The archive name a temporary file was going to be published as, if
/// `name` is one of ours.
pub fn parse_partial_name(name: &str) -> Option<&str> {
    let archive = name.strip_prefix('.')?.strip_suffix(PARTIAL_SUFFIX)?;
    parse_archive_name(archive).map(|_| archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn test_archive_name_format() {
        assert_eq!(archive_name(at(2024, 3, 7, 22, 15)), "2024-03-07-22-15.zip");
    }

    #[test]
    fn test_archive_name_truncates_seconds() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(22, 15, 59)
            .unwrap();
        assert_eq!(archive_name(time), "2024-03-07-22-15.zip");
    }

    #[test]
    fn test_parse_archive_name() {
        assert_eq!(
            parse_archive_name("2024-03-07-22-15.zip"),
            Some(at(2024, 3, 7, 22, 15))
        );
    }

    #[test]
    fn test_parse_rejects_unrelated_names() {
        for name in [
            "notes.txt",
            "2024-03-07-22-15",
            "2024-03-07-22-15.tar.gz",
            "2024-03-07-22-15.zip.tmp",
            "backup-2024-03-07-22-15.zip",
            "2024-13-07-22-15.zip",
            "2024-02-30-22-15.zip",
            "2024-03-07-24-00.zip",
            ".zip",
        ] {
            assert_eq!(parse_archive_name(name), None, "{name} should not parse");
        }
    }

    #[test]
    fn test_parse_rejects_non_canonical_padding() {
        assert_eq!(parse_archive_name("2024-3-7-22-15.zip"), None);
        assert_eq!(parse_archive_name("2024-03-07-22-15-30.zip"), None);
    }

    #[test]
    fn test_partial_name_is_not_an_archive() {
        let partial = partial_path(Path::new("/backups/2024-03-07-22-15.zip")).unwrap();
        assert_eq!(partial, PathBuf::from("/backups/.2024-03-07-22-15.zip.partial"));

        let name = partial.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_archive_name(name), None);
        assert_eq!(parse_partial_name(name), Some("2024-03-07-22-15.zip"));
        assert_eq!(parse_partial_name(".notes.txt.partial"), None);
        assert_eq!(parse_partial_name("2024-03-07-22-15.zip.partial"), None);
    }

    #[test]
    fn test_newest_first_tie_breaks_on_name() {
        let time = at(2024, 1, 1, 0, 0);
        let a = BackupArchive {
            name: "a".to_string(),
            created_at: time,
            path: PathBuf::from("a"),
        };
        let b = BackupArchive {
            name: "b".to_string(),
            created_at: time,
            path: PathBuf::from("b"),
        };
        assert_eq!(BackupArchive::newest_first(&a, &b), Ordering::Greater);
        assert_eq!(BackupArchive::newest_first(&b, &a), Ordering::Less);
    }
}
