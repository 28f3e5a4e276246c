//! Error types for the sync engine.

use sqlvault_storage::StorageError;
use std::io;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while hydrating or flushing the working copy.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The blob store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Local file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine could not write a consistent copy of the database.
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    /// A background or blocking task panicked or was cancelled.
    #[error("sync task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Returns true if the next scheduled upload may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Io(_) | Self::Snapshot(_) => true,
            Self::Task(_) => false,
        }
    }
}
