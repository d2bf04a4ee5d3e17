use std::collections::{BTreeMap, BTreeSet};

use crate::error::{RepositoryError, Result};
use crate::record::{Record, RepositoryId};

use super::require_id;

/// In-memory map from id to record.
///
/// The single source of truth for which records currently exist.
#[derive(Debug, Clone)]
pub struct MemoryIndex<R> {
    records: BTreeMap<RepositoryId, R>,
}

impl<R> Default for MemoryIndex<R> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<R: Record> MemoryIndex<R> {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn ids(&self) -> BTreeSet<RepositoryId> {
        self.records.keys().copied().collect()
    }

    /// `id` itself if it is non-nil and tracked.
    pub fn tracked(&self, id: RepositoryId) -> Result<RepositoryId> {
        let id = require_id(id)?;
        if self.records.contains_key(&id) {
            Ok(id)
        } else {
            Err(RepositoryError::NotFound(id))
        }
    }

    pub fn get(&self, id: RepositoryId) -> Result<&R> {
        let id = require_id(id)?;
        self.records.get(&id).ok_or(RepositoryError::NotFound(id))
    }

    /// Insert or replace by the record's own id.
    pub fn upsert(&mut self, record: R) {
        self.records.insert(record.id(), record);
    }

    pub fn remove(&mut self, id: RepositoryId) -> Option<R> {
        self.records.remove(&id)
    }
}
