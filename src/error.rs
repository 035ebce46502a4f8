//! Unified error type for discovery, history caching and index synchronization.

use thiserror::Error;

/// All errors that can occur while syncing repositories and indexes.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A backend probe or detection step failed; the directory is treated as
    /// a non-repository.
    #[error("Repository detection failed for {path}: {message}")]
    Detection { path: String, message: String },

    /// I/O error (file read/write, directory access)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// External command exited with a nonzero status
    #[error("Command '{command}' failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// External command ran past its timeout and was killed
    #[error("Command '{command}' timed out after {timeout_secs}s and was killed")]
    CommandTimeout { command: String, timeout_secs: u64 },

    /// The boundary revision of an incremental fetch did not match the cache
    #[error("Cached revision '{revision}' not found in the repository {repo}")]
    CacheInconsistency { repo: String, revision: String },

    /// Operation not implemented by a backend
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported { backend: String, operation: String },

    /// Another update or optimize pass holds this index
    #[error("Indexer already running for '{index}'")]
    AlreadyRunning { index: String },

    /// The analyzer refused the file
    #[error("Unsupported content in '{path}': {reason}")]
    UnsupportedContent { path: String, reason: String },

    /// Serialization/deserialization error (bincode)
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration file could not be read or parsed
    #[error("Invalid configuration {path}: {message}")]
    Config { path: String, message: String },

    /// Failed to load persisted data from disk
    #[error("Failed to load {path}: {message}")]
    IndexLoad { path: String, message: String },

    /// Lock poisoned (thread panicked while holding a lock)
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// A pooled worker task panicked; the panic is contained to that task
    #[error("Worker task panicked: {0}")]
    TaskPanicked(String),

    /// Argument validation error
    #[error("{0}")]
    InvalidArgs(String),
}

impl SyncError {
    /// True for failures of an external command or the filesystem.
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_) | SyncError::CommandFailed { .. } | SyncError::CommandTimeout { .. }
        )
    }

    /// True when the operation is simply not available for the backend.
    /// Batch callers treat this as a skip.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, SyncError::Unsupported { .. })
    }

    pub(crate) fn unsupported(backend: &str, operation: &str) -> Self {
        SyncError::Unsupported {
            backend: backend.to_string(),
            operation: operation.to_string(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned(e.to_string())
    }
}
