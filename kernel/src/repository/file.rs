use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::MINIMUM_TIME;
use crate::config::StoreConfig;
use crate::document::{Document, Entry};
use crate::error::{RepositoryError, Result};
use crate::increment::{increment_dir, parse_increment_name, write_increment};
use crate::lock::FileLock;
use crate::merge::{
    list_pending_increments, read_canonical, read_increment, DiagnosticSink, MergeReport, Merger,
    TracingSink,
};
use crate::record::{Record, RecordSerializer, RepositoryId};

use super::{DeletionAudit, MemoryRepository, Query, Repository};

/// Repository backed by a canonical file.
///
/// Reads are served from the in-memory layer. Every mutation is first
/// validated there, then written as an increment next to the canonical
/// file, applied in memory and merged. Once the increment is written the
/// change is made: a failed merge is still returned as an error, but the
/// increment stays pending and is folded by the next merge. The canonical
/// file stays locked for the lifetime of the repository except while a
/// merge runs.
pub struct FileRepository<R, S> {
    inner: MemoryRepository<R>,
    serializer: S,
    path: PathBuf,
    lock: FileLock,
    config: StoreConfig,
    sink: Box<dyn DiagnosticSink>,
}

impl<R, S> FileRepository<R, S>
where
    R: Record,
    S: RecordSerializer<R>,
{
    /// Open with the default configuration, logging merge warnings.
    pub fn open(path: impl Into<PathBuf>, serializer: S) -> Result<Self> {
        Self::open_with(path, serializer, StoreConfig::default(), Box::new(TracingSink))
    }

    /// Open `path`: lock it, fold leftover increments if configured, then
    /// load every record. Without the merge, leftover increments are read
    /// over the canonical document and stay pending.
    pub fn open_with(
        path: impl Into<PathBuf>,
        serializer: S,
        config: StoreConfig,
        sink: Box<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let path = path.into();
        ensure_canonical(&path, &config)?;

        let mut lock = FileLock::new(&path);
        lock.acquire()?;

        if config.merge_on_open {
            Merger::new(&config, &*sink).merge_all(&path, &mut lock, None)?;
        }

        let mut last_modified = watermark_of(&path)?;
        let mut document = read_canonical(&path)?;
        if !config.merge_on_open {
            last_modified = overlay_pending(&path, &mut document, last_modified)?;
        }
        let records = decode_records(&path, document, &serializer)?;
        info!(path = %path.display(), records = records.len(), "repository opened");

        Ok(Self {
            inner: MemoryRepository::with_records(records, last_modified),
            serializer,
            path,
            lock,
            config,
            sink,
        })
    }

    /// Report deletions to `audit` once they are on disk.
    pub fn with_audit(mut self, audit: impl DeletionAudit + 'static) -> Self {
        self.inner = self.inner.with_audit(audit);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    /// Fold any pending increments into the canonical file now.
    pub fn merge_pending(&mut self) -> Result<MergeReport> {
        Merger::new(&self.config, &*self.sink).merge_all(&self.path, &mut self.lock, None)
    }

    fn put_entry(&self, record: &R) -> Result<Entry> {
        Ok(Entry::Put {
            id: record.id(),
            document: self.serializer.serialize(record)?,
        })
    }

    fn write(&self, entries: Vec<Entry>, stamp: DateTime<Utc>) -> Result<()> {
        let written = write_increment(increment_dir(&self.path), entries, stamp)?;
        debug!(increment = ?written, "increment written");
        Ok(())
    }

    // On success the canonical mtime ends up at `stamp`.
    fn merge(&mut self, stamp: DateTime<Utc>) -> Result<()> {
        Merger::new(&self.config, &*self.sink).merge_all(
            &self.path,
            &mut self.lock,
            Some(stamp),
        )?;
        Ok(())
    }
}

impl<R, S> Repository for FileRepository<R, S>
where
    R: Record,
    S: RecordSerializer<R>,
{
    type Record = R;

    fn create_record(&mut self) -> Result<R> {
        let record = R::with_id(RepositoryId::new());
        let stamp = self.inner.next_stamp();
        let entry = self.put_entry(&record)?;
        self.write(vec![entry], stamp)?;
        self.inner.apply_upsert(vec![record.clone()], stamp);
        self.merge(stamp)?;
        Ok(record)
    }

    fn count_all(&self) -> usize {
        self.inner.count_all()
    }

    fn all_ids(&self) -> BTreeSet<RepositoryId> {
        self.inner.all_ids()
    }

    fn get_id(&self, record: &R) -> Result<RepositoryId> {
        self.inner.get_id(record)
    }

    fn get_by_id(&self, id: RepositoryId) -> Result<&R> {
        self.inner.get_by_id(id)
    }

    fn save(&mut self, record: &R) -> Result<()> {
        self.save_batch(std::slice::from_ref(record))
    }

    fn save_batch(&mut self, records: &[R]) -> Result<()> {
        self.inner.check_all(records)?;
        if records.is_empty() {
            return Ok(());
        }

        let entries = records
            .iter()
            .map(|r| self.put_entry(r))
            .collect::<Result<Vec<_>>>()?;
        let stamp = self.inner.next_stamp();
        self.write(entries, stamp)?;
        self.inner.apply_upsert(records.to_vec(), stamp);
        self.merge(stamp)
    }

    fn delete(&mut self, record: &R) -> Result<()> {
        let id = self.inner.get_id(record)?;
        self.delete_by_id(id)
    }

    fn delete_by_id(&mut self, id: RepositoryId) -> Result<()> {
        let id = self.inner.index().tracked(id)?;
        let stamp = self.inner.next_stamp();
        self.write(vec![Entry::Delete { id }], stamp)?;
        self.inner.apply_delete(&[id], stamp);
        self.merge(stamp)
    }

    fn delete_all(&mut self) -> Result<()> {
        let ids: Vec<_> = self.inner.all_ids().into_iter().collect();
        if ids.is_empty() {
            return Ok(());
        }

        let entries = ids.iter().map(|&id| Entry::Delete { id }).collect();
        let stamp = self.inner.next_stamp();
        self.write(entries, stamp)?;
        self.inner.apply_delete(&ids, stamp);
        self.merge(stamp)
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.inner.last_modified()
    }

    fn supports_query(&self) -> bool {
        false
    }

    fn supports_persistence(&self) -> bool {
        true
    }

    fn query(&self, _query: &Query) -> Result<Vec<RepositoryId>> {
        Err(RepositoryError::Unsupported("querying"))
    }
}

fn ensure_canonical(path: &Path, config: &StoreConfig) -> Result<()> {
    match fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound && config.create_if_missing => {
            File::create(path).map_err(|e| RepositoryError::io(path, e))?;
            Ok(())
        }
        Err(e) => Err(RepositoryError::io(path, e)),
    }
}

// A zero-length canonical file has never been written by a merge.
fn watermark_of(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = fs::metadata(path).map_err(|e| RepositoryError::io(path, e))?;
    if metadata.len() == 0 {
        return Ok(MINIMUM_TIME);
    }
    let modified = metadata
        .modified()
        .map_err(|e| RepositoryError::io(path, e))?;
    Ok(modified.into())
}

// Increments left pending at open still belong to the record set, and new
// stamps must sort after theirs. Unreadable ones are left to the next merge.
fn overlay_pending(
    path: &Path,
    document: &mut Document,
    mut watermark: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    for increment in list_pending_increments(path)? {
        let stamp = increment
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_increment_name);
        if let Some(stamp) = stamp {
            watermark = watermark.max(stamp);
        }

        match read_increment(&increment) {
            Ok(pending) => document.apply(pending),
            Err(RepositoryError::CorruptIncrement(corrupt)) => {
                debug!(%corrupt, "skipping unreadable increment until the next merge");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(watermark)
}

fn decode_records<R, S>(path: &Path, document: Document, serializer: &S) -> Result<Vec<R>>
where
    R: Record,
    S: RecordSerializer<R>,
{
    let mut records = Vec::with_capacity(document.len());

    for entry in document.into_entries() {
        let (id, fragment) = match entry {
            Entry::Put { id, document } => (id, document),
            Entry::Delete { id } => {
                return Err(malformed(path, format!("deletion marker for {id} in canonical file")))
            }
        };

        let record = match serializer.deserialize(&fragment) {
            Ok(record) => record,
            Err(err) => {
                return Err(match serializer.validate_structure(&fragment) {
                    Err(diagnostic) => malformed(path, format!("record {id}: {diagnostic}")),
                    Ok(()) => err.into(),
                })
            }
        };
        if record.id() != id {
            return Err(malformed(
                path,
                format!("entry {id} holds a record with id {}", record.id()),
            ));
        }
        records.push(record);
    }

    Ok(records)
}

fn malformed(path: &Path, diagnostic: String) -> RepositoryError {
    RepositoryError::MalformedDocument {
        path: path.to_path_buf(),
        diagnostic,
    }
}
