use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::clock::{self, MINIMUM_TIME};
use crate::error::{RepositoryError, Result};
use crate::record::{Record, RepositoryId};

use super::{DeletionAudit, MemoryIndex, Query, Repository};

/// Repository that lives only in memory.
///
/// Also the inner layer of `FileRepository`, which validates through it
/// and applies changes to it once they are on disk.
pub struct MemoryRepository<R> {
    index: MemoryIndex<R>,
    last_modified: DateTime<Utc>,
    audit: Option<Box<dyn DeletionAudit>>,
}

impl<R: Record> Default for MemoryRepository<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> MemoryRepository<R> {
    pub fn new() -> Self {
        Self::with_records(Vec::new(), MINIMUM_TIME)
    }

    /// Start from an existing record set and watermark.
    pub fn with_records(records: impl IntoIterator<Item = R>, last_modified: DateTime<Utc>) -> Self {
        let mut index = MemoryIndex::new();
        for record in records {
            index.upsert(record);
        }
        Self {
            index,
            last_modified,
            audit: None,
        }
    }

    /// Report deletions to `audit`.
    pub fn with_audit(mut self, audit: impl DeletionAudit + 'static) -> Self {
        self.audit = Some(Box::new(audit));
        self
    }

    pub(crate) fn index(&self) -> &MemoryIndex<R> {
        &self.index
    }

    /// Stamp the next change will carry.
    pub(crate) fn next_stamp(&self) -> DateTime<Utc> {
        clock::next_after(self.last_modified)
    }

    /// Ids of `records`, failing on the first one not tracked.
    pub(crate) fn check_all(&self, records: &[R]) -> Result<Vec<RepositoryId>> {
        records.iter().map(|r| self.get_id(r)).collect()
    }

    pub(crate) fn apply_upsert(&mut self, records: Vec<R>, stamp: DateTime<Utc>) {
        for record in records {
            self.index.upsert(record);
        }
        self.last_modified = stamp;
    }

    pub(crate) fn apply_delete(&mut self, ids: &[RepositoryId], stamp: DateTime<Utc>) {
        for id in ids {
            if self.index.remove(*id).is_some() {
                if let Some(audit) = &self.audit {
                    audit.record_deleted(*id);
                }
            }
        }
        self.last_modified = stamp;
    }
}

impl<R: Record> Repository for MemoryRepository<R> {
    type Record = R;

    fn create_record(&mut self) -> Result<R> {
        let record = R::with_id(RepositoryId::new());
        let stamp = self.next_stamp();
        self.apply_upsert(vec![record.clone()], stamp);
        Ok(record)
    }

    fn count_all(&self) -> usize {
        self.index.len()
    }

    fn all_ids(&self) -> BTreeSet<RepositoryId> {
        self.index.ids()
    }

    fn get_id(&self, record: &R) -> Result<RepositoryId> {
        self.index.tracked(record.id())
    }

    fn get_by_id(&self, id: RepositoryId) -> Result<&R> {
        self.index.get(id)
    }

    fn save(&mut self, record: &R) -> Result<()> {
        self.save_batch(std::slice::from_ref(record))
    }

    fn save_batch(&mut self, records: &[R]) -> Result<()> {
        self.check_all(records)?;
        if records.is_empty() {
            return Ok(());
        }
        let stamp = self.next_stamp();
        self.apply_upsert(records.to_vec(), stamp);
        Ok(())
    }

    fn delete(&mut self, record: &R) -> Result<()> {
        let id = self.get_id(record)?;
        self.delete_by_id(id)
    }

    fn delete_by_id(&mut self, id: RepositoryId) -> Result<()> {
        let id = self.index.tracked(id)?;
        let stamp = self.next_stamp();
        self.apply_delete(&[id], stamp);
        Ok(())
    }

    fn delete_all(&mut self) -> Result<()> {
        let ids: Vec<_> = self.index.ids().into_iter().collect();
        if ids.is_empty() {
            return Ok(());
        }
        let stamp = self.next_stamp();
        self.apply_delete(&ids, stamp);
        Ok(())
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    fn supports_query(&self) -> bool {
        false
    }

    fn supports_persistence(&self) -> bool {
        false
    }

    fn query(&self, _query: &Query) -> Result<Vec<RepositoryId>> {
        Err(RepositoryError::Unsupported("querying"))
    }
}
