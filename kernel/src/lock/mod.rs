// Canonical File Lock
//
// While a repository is open it keeps a read handle on the canonical
// file with an advisory exclusive lock on it. Another repository (in
// this or any other process) cannot open the same file meanwhile. The
// lock is dropped only for the duration of a merge.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{RepositoryError, Result};

#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    handle: Option<File>,
}

impl FileLock {
    /// A lock for `path`, not yet held.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the file and lock it.
    ///
    /// Fails with `LockUnavailable` if someone else holds it. Acquiring a
    /// lock that is already held is a bug in the caller.
    pub fn acquire(&mut self) -> Result<()> {
        debug_assert!(!self.is_held(), "lock on {} acquired twice", self.path.display());

        let file = File::open(&self.path).map_err(|e| RepositoryError::io(&self.path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                return Err(RepositoryError::LockUnavailable {
                    path: self.path.clone(),
                })
            }
            Err(e) => return Err(RepositoryError::io(&self.path, e)),
        }

        debug!(path = %self.path.display(), "lock acquired");
        self.handle = Some(file);
        Ok(())
    }

    /// Close the handle, which drops the lock with it.
    pub fn release(&mut self) {
        debug_assert!(self.is_held(), "lock on {} released while not held", self.path.display());

        if self.handle.take().is_some() {
            debug!(path = %self.path.display(), "lock released");
        }
    }

    /// Run `f` with the lock released, then take it back.
    ///
    /// The lock is re-acquired whether or not `f` succeeds. If `f` fails
    /// its error wins over a re-acquisition failure.
    pub fn while_released<T>(&mut self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.release();
        let outcome = f();
        let relocked = self.acquire();
        let value = outcome?;
        relocked?;
        Ok(value)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
