// Error Taxonomy
//
// Every fallible repository, merge and lock operation reports one of
// these kinds. Precondition violations (`NotFound`, `InvalidArgument`)
// are never retried; everything touching the disk carries its path.

use std::io;
use std::path::PathBuf;

use crate::record::{CodecError, RepositoryId};

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record {0} is not tracked by this repository")]
    NotFound(RepositoryId),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("{0} is not supported by this repository")]
    Unsupported(&'static str),

    #[error("canonical file {} is locked by another process", path.display())]
    LockUnavailable { path: PathBuf },

    #[error(transparent)]
    CorruptIncrement(#[from] CorruptIncrement),

    #[error("malformed document {}: {diagnostic}", path.display())]
    MalformedDocument { path: PathBuf, diagnostic: String },

    #[error("record codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("persistence failure at {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RepositoryError {
    /// Wrap an I/O failure with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RepositoryError::Persistence {
            path: path.into(),
            source,
        }
    }
}

/// Why an increment file could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptKind {
    /// Zero bytes or whitespace only: a write interrupted by a crash.
    Empty,

    /// Non-trivial content that does not follow the document grammar.
    Malformed(String),
}

/// An increment file that failed to parse.
///
/// The merge handles both kinds itself (deleted or quarantined); a failure
/// to delete or rename the file surfaces as `Persistence`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("corrupt increment {}: {}", path.display(), describe(kind))]
pub struct CorruptIncrement {
    pub path: PathBuf,
    pub kind: CorruptKind,
}

fn describe(kind: &CorruptKind) -> String {
    match kind {
        CorruptKind::Empty => "file is empty".into(),
        CorruptKind::Malformed(reason) => reason.clone(),
    }
}
