// Lexstore Kernel
//
// File-backed record repository with crash-safe incremental updates:
// every mutation is written to a timestamped increment file, then merged
// into the canonical file while it is briefly unlocked.

pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod increment;
pub mod lock;
pub mod merge;
pub mod record;
pub mod repository;

pub use error::{RepositoryError, Result};
