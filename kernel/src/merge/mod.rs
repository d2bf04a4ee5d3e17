// Merge Engine
//
// Folds pending increment files into the canonical file, oldest first.
// The canonical file is rewritten through a sibling temp file and a
// rename, so a crash leaves either the old or the new version in place.
// Consumed increments are deleted only after the rewrite; if the process
// dies in between they are simply applied again.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::document::{Document, DocumentError};
use crate::error::{CorruptIncrement, CorruptKind, RepositoryError, Result};
use crate::increment::{increment_dir, parse_increment_name};
use crate::lock::FileLock;

/// What the merge did with an unreadable increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Blank file from an interrupted write, removed.
    Deleted,

    /// Kept for manual recovery under a new name.
    Quarantined { to: PathBuf },
}

/// Non-fatal problem met while merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeWarning {
    pub increment: PathBuf,
    pub reason: String,
    pub action: RecoveryAction,
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            RecoveryAction::Deleted => write!(
                f,
                "increment {} was empty, probably left by a save interrupted by a crash; \
                 it was removed, check that no recent work is missing",
                self.increment.display()
            ),
            RecoveryAction::Quarantined { to } => write!(
                f,
                "increment {} could not be read ({}); the work it holds may be recoverable from {}",
                self.increment.display(),
                self.reason,
                to.display()
            ),
        }
    }
}

/// Receives recoverable merge warnings.
pub trait DiagnosticSink {
    fn warning(&self, warning: &MergeWarning);
}

/// Default sink: a `warn!` event per warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn warning(&self, warning: &MergeWarning) {
        warn!(increment = %warning.increment.display(), "{warning}");
    }
}

impl DiagnosticSink for mpsc::Sender<MergeWarning> {
    fn warning(&self, warning: &MergeWarning) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.send(warning.clone());
    }
}

/// Outcome of one `merge_all` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Increments folded into the canonical file and deleted, in order.
    pub merged: Vec<PathBuf>,
    pub warnings: Vec<MergeWarning>,
}

impl MergeReport {
    /// True when there was nothing pending.
    pub fn is_noop(&self) -> bool {
        self.merged.is_empty() && self.warnings.is_empty()
    }
}

/// Increment files waiting next to `canonical`, oldest first.
///
/// Ordering is by the timestamp embedded in each name, then by name.
pub fn list_pending_increments(canonical: &Path) -> Result<Vec<PathBuf>> {
    let dir = increment_dir(canonical);
    let read_dir = fs::read_dir(dir).map_err(|e| RepositoryError::io(dir, e))?;

    let mut pending = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| RepositoryError::io(dir, e))?;
        let is_file = entry
            .file_type()
            .map_err(|e| RepositoryError::io(entry.path(), e))?
            .is_file();
        if !is_file {
            continue;
        }
        let name = entry.file_name();
        if let Some(stamp) = name.to_str().and_then(parse_increment_name) {
            pending.push((stamp, entry.path()));
        }
    }

    pending.sort();
    debug!(dir = %dir.display(), count = pending.len(), "scanned for pending increments");
    Ok(pending.into_iter().map(|(_, path)| path).collect())
}

/// Read a canonical file. A zero-length or blank file holds no records.
pub fn read_canonical(path: &Path) -> Result<Document> {
    let text = fs::read_to_string(path).map_err(|e| RepositoryError::io(path, e))?;
    match Document::parse(&text) {
        Ok(document) => Ok(document),
        Err(DocumentError::Empty) => Ok(Document::new()),
        Err(e @ DocumentError::Malformed { .. }) => Err(RepositoryError::MalformedDocument {
            path: path.to_path_buf(),
            diagnostic: e.to_string(),
        }),
    }
}

/// Read and parse one increment, classifying parse failures.
pub fn read_increment(path: &Path) -> Result<Document> {
    let bytes = fs::read(path).map_err(|e| RepositoryError::io(path, e))?;
    let corrupt = |kind| CorruptIncrement {
        path: path.to_path_buf(),
        kind,
    };

    let text = String::from_utf8(bytes)
        .map_err(|_| corrupt(CorruptKind::Malformed("not valid UTF-8".into())))?;
    Document::parse(&text).map_err(|e| match e {
        DocumentError::Empty => corrupt(CorruptKind::Empty).into(),
        malformed => corrupt(CorruptKind::Malformed(malformed.to_string())).into(),
    })
}

/// Atomically replace the canonical file with `document`.
pub fn write_canonical(path: &Path, document: &Document) -> Result<()> {
    let temp = sibling(path, "merging");

    let written = (|| -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp)?);
        document.write_to(&mut writer)?;
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(RepositoryError::io(&temp, e));
    }

    fs::rename(&temp, path).map_err(|e| RepositoryError::io(path, e))
}

/// Merges pending increments into a canonical file.
///
/// Holds configuration and the warning sink only; every call starts
/// from what is on disk.
pub struct Merger<'a> {
    config: &'a StoreConfig,
    sink: &'a dyn DiagnosticSink,
}

impl<'a> Merger<'a> {
    pub fn new(config: &'a StoreConfig, sink: &'a dyn DiagnosticSink) -> Self {
        Self { config, sink }
    }

    /// Fold every pending increment into the canonical file.
    ///
    /// Does nothing, and keeps the lock, when nothing is pending. Otherwise
    /// the lock is released for the merge and taken back afterwards on
    /// every path. When `watermark` is given the canonical file's
    /// modification time is set to it before the lock is re-acquired.
    pub fn merge_all(
        &self,
        canonical: &Path,
        lock: &mut FileLock,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<MergeReport> {
        let pending = list_pending_increments(canonical)?;
        if pending.is_empty() {
            return Ok(MergeReport::default());
        }

        lock.while_released(|| self.fold(canonical, &pending, watermark))
    }

    // The caller must not hold the lock.
    fn fold(
        &self,
        canonical: &Path,
        pending: &[PathBuf],
        watermark: Option<DateTime<Utc>>,
    ) -> Result<MergeReport> {
        let mut document = read_canonical(canonical)?;
        let mut report = MergeReport::default();

        for path in pending {
            match read_increment(path) {
                Ok(increment) => {
                    document.apply(increment);
                    report.merged.push(path.clone());
                }
                Err(RepositoryError::CorruptIncrement(corrupt)) => {
                    let warning = self.recover(corrupt)?;
                    self.sink.warning(&warning);
                    report.warnings.push(warning);
                }
                Err(e) => return Err(e),
            }
        }

        if !report.merged.is_empty() {
            write_canonical(canonical, &document)?;
        }
        for path in &report.merged {
            fs::remove_file(path).map_err(|e| RepositoryError::io(path, e))?;
        }
        if let Some(stamp) = watermark {
            set_modified(canonical, stamp)?;
        }

        info!(
            canonical = %canonical.display(),
            merged = report.merged.len(),
            recovered = report.warnings.len(),
            records = document.len(),
            "merged pending increments"
        );
        Ok(report)
    }

    fn recover(&self, corrupt: CorruptIncrement) -> Result<MergeWarning> {
        let CorruptIncrement { path, kind } = corrupt;
        match kind {
            CorruptKind::Empty => {
                fs::remove_file(&path).map_err(|e| RepositoryError::io(&path, e))?;
                Ok(MergeWarning {
                    increment: path,
                    reason: "file is empty".into(),
                    action: RecoveryAction::Deleted,
                })
            }
            CorruptKind::Malformed(reason) => {
                let to = sibling(&path, &self.config.quarantine_suffix);
                fs::rename(&path, &to).map_err(|e| RepositoryError::io(&path, e))?;
                Ok(MergeWarning {
                    increment: path,
                    reason,
                    action: RecoveryAction::Quarantined { to },
                })
            }
        }
    }
}

/// Set a file's modification time.
pub fn set_modified(path: &Path, stamp: DateTime<Utc>) -> Result<()> {
    File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::from(stamp)))
        .map_err(|e| RepositoryError::io(path, e))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Entry;
    use crate::increment::{increment_file_name, write_increment};
    use crate::record::RepositoryId;
    use chrono::{TimeDelta, TimeZone};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        canonical: PathBuf,
        config: StoreConfig,
    }

    impl Fixture {
        fn new(entries: Vec<Entry>) -> Self {
            let tmp = TempDir::new().unwrap();
            let canonical = tmp.path().join("dict.lift");
            write_canonical(&canonical, &Document::from_entries(entries)).unwrap();
            Self {
                _tmp: tmp,
                canonical,
                config: StoreConfig::default(),
            }
        }

        fn dir(&self) -> &Path {
            self.canonical.parent().unwrap()
        }

        fn locked(&self) -> FileLock {
            let mut lock = FileLock::new(&self.canonical);
            lock.acquire().unwrap();
            lock
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn put(id: RepositoryId, document: &str) -> Entry {
        Entry::Put {
            id,
            document: document.into(),
        }
    }

    #[test]
    fn nothing_pending_is_a_noop() {
        let fx = Fixture::new(vec![]);
        let mut lock = fx.locked();
        let before = fs::metadata(&fx.canonical).unwrap().modified().unwrap();

        let report = Merger::new(&fx.config, &TracingSink)
            .merge_all(&fx.canonical, &mut lock, None)
            .unwrap();

        assert!(report.is_noop());
        assert!(lock.is_held());
        assert_eq!(fs::metadata(&fx.canonical).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn pending_are_listed_oldest_first() {
        let fx = Fixture::new(vec![]);
        let later = write_increment(fx.dir(), vec![put(RepositoryId::new(), "b")], base() + TimeDelta::seconds(5))
            .unwrap()
            .unwrap();
        let earlier = write_increment(fx.dir(), vec![put(RepositoryId::new(), "a")], base())
            .unwrap()
            .unwrap();
        fs::write(fx.dir().join("readme.update"), "not an increment").unwrap();

        let pending = list_pending_increments(&fx.canonical).unwrap();
        assert_eq!(pending, vec![earlier, later]);
    }

    #[test]
    fn later_increment_wins_for_same_id() {
        let id = RepositoryId::new();
        let fx = Fixture::new(vec![put(id, "v0")]);
        write_increment(fx.dir(), vec![put(id, "v1")], base()).unwrap();
        write_increment(fx.dir(), vec![put(id, "v2")], base() + TimeDelta::milliseconds(1)).unwrap();
        let mut lock = fx.locked();

        let report = Merger::new(&fx.config, &TracingSink)
            .merge_all(&fx.canonical, &mut lock, None)
            .unwrap();

        assert_eq!(report.merged.len(), 2);
        assert!(lock.is_held());
        assert!(list_pending_increments(&fx.canonical).unwrap().is_empty());
        assert_eq!(read_canonical(&fx.canonical).unwrap().entries(), &[put(id, "v2")]);
    }

    #[test]
    fn order_follows_names_not_write_order() {
        // A clock stepped backwards between two saves makes the newer
        // write carry the older name; the older name is applied first.
        let id = RepositoryId::new();
        let fx = Fixture::new(vec![]);
        write_increment(fx.dir(), vec![put(id, "written-first")], base() + TimeDelta::hours(1)).unwrap();
        write_increment(fx.dir(), vec![put(id, "written-second")], base()).unwrap();
        let mut lock = fx.locked();

        Merger::new(&fx.config, &TracingSink)
            .merge_all(&fx.canonical, &mut lock, None)
            .unwrap();

        assert_eq!(
            read_canonical(&fx.canonical).unwrap().entries(),
            &[put(id, "written-first")]
        );
    }

    #[test]
    fn blank_increment_is_deleted_with_warning() {
        let id = RepositoryId::new();
        let fx = Fixture::new(vec![]);
        let blank = fx.dir().join(increment_file_name(base()));
        fs::write(&blank, "").unwrap();
        write_increment(fx.dir(), vec![put(id, "kept")], base() + TimeDelta::seconds(1)).unwrap();
        let (tx, rx) = mpsc::channel::<MergeWarning>();
        let mut lock = fx.locked();

        let report = Merger::new(&fx.config, &tx)
            .merge_all(&fx.canonical, &mut lock, None)
            .unwrap();

        assert!(!blank.exists());
        assert_eq!(report.merged.len(), 1);
        let warning = rx.try_recv().unwrap();
        assert_eq!(warning.action, RecoveryAction::Deleted);
        assert_eq!(warning.increment, blank);
        assert_eq!(read_canonical(&fx.canonical).unwrap().len(), 1);
    }

    #[test]
    fn garbage_increment_is_quarantined_and_not_applied() {
        let fx = Fixture::new(vec![]);
        let bad = fx.dir().join(increment_file_name(base()));
        fs::write(&bad, "{\"kind\":\"begin\",\"format\":1}\n{\"kind\":\"put\",\"id\":").unwrap();
        let (tx, rx) = mpsc::channel::<MergeWarning>();
        let mut lock = fx.locked();

        let report = Merger::new(&fx.config, &tx)
            .merge_all(&fx.canonical, &mut lock, None)
            .unwrap();

        let quarantined = sibling(&bad, "bad");
        assert!(!bad.exists());
        assert!(quarantined.exists());
        assert!(report.merged.is_empty());
        assert_eq!(
            rx.try_recv().unwrap().action,
            RecoveryAction::Quarantined { to: quarantined }
        );
        assert!(read_canonical(&fx.canonical).unwrap().is_empty());
        assert!(list_pending_increments(&fx.canonical).unwrap().is_empty());
    }

    #[test]
    fn failed_quarantine_is_fatal() {
        let fx = Fixture::new(vec![]);
        let bad = fx.dir().join(increment_file_name(base()));
        fs::write(&bad, "half a line").unwrap();
        fs::create_dir(sibling(&bad, "bad")).unwrap();
        let (tx, rx) = mpsc::channel::<MergeWarning>();
        let mut lock = fx.locked();

        let err = Merger::new(&fx.config, &tx)
            .merge_all(&fx.canonical, &mut lock, None)
            .unwrap_err();

        assert!(matches!(err, RepositoryError::Persistence { .. }), "{err}");
        assert!(lock.is_held());
        assert!(bad.exists());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn watermark_becomes_canonical_mtime() {
        let fx = Fixture::new(vec![]);
        write_increment(fx.dir(), vec![put(RepositoryId::new(), "x")], base()).unwrap();
        let watermark = base() + TimeDelta::nanoseconds(1_500);
        let mut lock = fx.locked();

        Merger::new(&fx.config, &TracingSink)
            .merge_all(&fx.canonical, &mut lock, Some(watermark))
            .unwrap();

        let mtime: DateTime<Utc> = fs::metadata(&fx.canonical).unwrap().modified().unwrap().into();
        // Filesystems differ in mtime resolution; microseconds are safe.
        assert_eq!(mtime.timestamp_micros(), watermark.timestamp_micros());
    }

    #[test]
    fn second_merge_leaves_canonical_untouched() {
        let fx = Fixture::new(vec![]);
        write_increment(fx.dir(), vec![put(RepositoryId::new(), "x")], base()).unwrap();
        let mut lock = fx.locked();
        let merger = Merger::new(&fx.config, &TracingSink);

        merger.merge_all(&fx.canonical, &mut lock, None).unwrap();
        let text = fs::read_to_string(&fx.canonical).unwrap();
        let mtime = fs::metadata(&fx.canonical).unwrap().modified().unwrap();

        assert!(merger.merge_all(&fx.canonical, &mut lock, None).unwrap().is_noop());
        assert_eq!(fs::read_to_string(&fx.canonical).unwrap(), text);
        assert_eq!(fs::metadata(&fx.canonical).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn malformed_canonical_is_reported_structurally() {
        let fx = Fixture::new(vec![]);
        fs::write(&fx.canonical, "<lift version=\"0.12\">").unwrap();

        let err = read_canonical(&fx.canonical).unwrap_err();
        assert!(matches!(err, RepositoryError::MalformedDocument { .. }), "{err}");
    }
}
