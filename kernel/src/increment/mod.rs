// Increment Writer
//
// Each mutation lands in its own immutable file next to the canonical
// file, named by the UTC time it was written. Names sort in the order
// the increments were created.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::debug;

use crate::clock;
use crate::document::{Document, Entry};
use crate::error::{RepositoryError, Result};

/// Extension shared by the writer and the merge engine's discovery scan.
pub const INCREMENT_EXTENSION: &str = "update";

const NAME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%9fZ";

/// Directory holding the increments of `canonical`.
pub fn increment_dir(canonical: &Path) -> &Path {
    match canonical.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// File name (without directory) of the increment written at `stamp`.
pub fn increment_file_name(stamp: DateTime<Utc>) -> String {
    format!("{}.{INCREMENT_EXTENSION}", stamp.format(NAME_FORMAT))
}

/// Recover the timestamp from an increment file name.
///
/// Returns `None` for anything that does not follow the naming
/// convention, including other files that happen to share the extension.
pub fn parse_increment_name(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(INCREMENT_EXTENSION)?.strip_suffix('.')?;
    NaiveDateTime::parse_from_str(stem, NAME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Write `entries` as a new increment in `dir`.
///
/// The name embeds `stamp`; if that name is taken the stamp is advanced
/// one tick at a time until a free name is found. Nothing is written for
/// an empty entry set. The file is synced before returning.
pub fn write_increment(
    dir: &Path,
    entries: Vec<Entry>,
    stamp: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    if entries.is_empty() {
        return Ok(None);
    }

    let (path, file) = create_unique(dir, stamp)?;
    let document = Document::from_entries(entries);

    let mut writer = BufWriter::new(file);
    document
        .write_to(&mut writer)
        .and_then(|_| writer.flush())
        .map_err(|e| RepositoryError::io(&path, e))?;
    let file = writer
        .into_inner()
        .map_err(|e| RepositoryError::io(&path, e.into_error()))?;
    file.sync_all().map_err(|e| RepositoryError::io(&path, e))?;

    debug!(path = %path.display(), entries = document.len(), "increment written");
    Ok(Some(path))
}

fn create_unique(dir: &Path, mut stamp: DateTime<Utc>) -> Result<(PathBuf, File)> {
    loop {
        let path = dir.join(increment_file_name(stamp));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                stamp = stamp + clock::tick();
            }
            Err(e) => return Err(RepositoryError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RepositoryId;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap() + chrono::TimeDelta::nanoseconds(1234)
    }

    fn delete_entry() -> Entry {
        Entry::Delete {
            id: RepositoryId::new(),
        }
    }

    #[test]
    fn name_embeds_nanosecond_stamp() {
        assert_eq!(
            increment_file_name(stamp()),
            "2024-03-09T14-05-07-000001234Z.update"
        );
        assert_eq!(
            parse_increment_name("2024-03-09T14-05-07-000001234Z.update"),
            Some(stamp())
        );
    }

    #[test]
    fn foreign_names_are_not_increments() {
        assert_eq!(parse_increment_name("notes.update"), None);
        assert_eq!(parse_increment_name("2024-03-09T14-05-07-000001234Z.update.bad"), None);
        assert_eq!(parse_increment_name("2024-03-09T14-05-07-000001234Z.lift"), None);
    }

    #[test]
    fn names_sort_chronologically() {
        let earlier = increment_file_name(stamp());
        let later = increment_file_name(stamp() + chrono::TimeDelta::seconds(1));
        assert!(earlier < later);
    }

    #[test]
    fn empty_entry_set_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = write_increment(tmp.path(), vec![], stamp()).unwrap();

        assert!(path.is_none());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn collision_advances_by_one_tick() {
        let tmp = TempDir::new().unwrap();

        let first = write_increment(tmp.path(), vec![delete_entry()], stamp())
            .unwrap()
            .unwrap();
        let second = write_increment(tmp.path(), vec![delete_entry()], stamp())
            .unwrap()
            .unwrap();

        assert_ne!(first, second);
        let name = second.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_increment_name(name), Some(stamp() + clock::tick()));
    }

    #[test]
    fn written_file_is_a_complete_document() {
        let tmp = TempDir::new().unwrap();
        let entries = vec![delete_entry(), delete_entry()];

        let path = write_increment(tmp.path(), entries.clone(), stamp())
            .unwrap()
            .unwrap();
        let text = std::fs::read_to_string(path).unwrap();

        assert_eq!(Document::parse(&text).unwrap().into_entries(), entries);
    }
}
