// Repository
//
// Keyed access to records. `MemoryRepository` keeps them in memory only;
// `FileRepository` wraps one and makes every mutation durable through an
// increment file and a merge before returning.

use std::collections::BTreeSet;
use std::sync::mpsc;

use chrono::{DateTime, Utc};

use crate::error::{RepositoryError, Result};
use crate::record::{Record, RepositoryId};

pub mod file;
mod index;
pub mod memory;

pub use file::FileRepository;
pub(crate) use index::MemoryIndex;
pub use memory::MemoryRepository;

/// Exact-match query on a named field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub field: String,
    pub value: String,
}

impl Query {
    pub fn exact(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Told about every record deletion once it has taken effect.
pub trait DeletionAudit {
    fn record_deleted(&self, id: RepositoryId);
}

impl DeletionAudit for mpsc::Sender<RepositoryId> {
    fn record_deleted(&self, id: RepositoryId) {
        let _ = self.send(id);
    }
}

/// Create/read/update/delete over a set of records.
///
/// A record is tracked while its id is in the repository. Operations on
/// untracked records fail with `NotFound`; a nil id fails with
/// `InvalidArgument`. Every call that changes the record set moves
/// `last_modified` strictly forward; calls that change nothing leave it.
pub trait Repository {
    type Record: Record;

    /// Allocate a record with a fresh id and start tracking it.
    fn create_record(&mut self) -> Result<Self::Record>;

    fn count_all(&self) -> usize;

    fn all_ids(&self) -> BTreeSet<RepositoryId>;

    /// Id of `record`, if it is tracked.
    fn get_id(&self, record: &Self::Record) -> Result<RepositoryId>;

    fn get_by_id(&self, id: RepositoryId) -> Result<&Self::Record>;

    /// Store the current content of a tracked record.
    fn save(&mut self, record: &Self::Record) -> Result<()>;

    /// Store several tracked records as one change.
    ///
    /// Every record is checked before anything is stored. An empty batch
    /// changes nothing.
    fn save_batch(&mut self, records: &[Self::Record]) -> Result<()>;

    fn delete(&mut self, record: &Self::Record) -> Result<()>;

    fn delete_by_id(&mut self, id: RepositoryId) -> Result<()>;

    /// Remove every record. Idempotent.
    fn delete_all(&mut self) -> Result<()>;

    /// UTC time of the last change, `MINIMUM_TIME` if there never was one.
    fn last_modified(&self) -> DateTime<Utc>;

    fn supports_query(&self) -> bool;

    fn supports_persistence(&self) -> bool;

    fn query(&self, query: &Query) -> Result<Vec<RepositoryId>>;
}

/// Reject the nil id.
pub(crate) fn require_id(id: RepositoryId) -> Result<RepositoryId> {
    if id.is_nil() {
        return Err(RepositoryError::InvalidArgument("record id is nil"));
    }
    Ok(id)
}
