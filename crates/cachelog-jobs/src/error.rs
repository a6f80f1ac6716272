use std::path::PathBuf;

use cachelog_types::OperationId;
use cachelog_worker::WorkerError;

/// Errors returned by job operations
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Caller input failed a precondition; nothing was attempted
    #[error("invalid request: {0}")]
    Validation(String),

    /// An exclusive operation of the same kind is already active
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no removal operation with id {0}")]
    NotFound(OperationId),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// Conflicts are worth retrying once the active operation finishes
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors from persisting the processing position
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read position file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write position file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("position file {} is corrupt: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode position: {0}")]
    Encode(#[from] serde_json::Error),
}
