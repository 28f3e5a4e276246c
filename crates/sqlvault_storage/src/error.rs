//! Error types for blob store operations.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for blob store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during blob store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The logical database name cannot be mapped to a blob.
    #[error("invalid database name: {0:?}")]
    InvalidName(String),

    /// The remote service rejected or failed the request.
    #[error("{backend} backend error: {message}")]
    Backend {
        /// Backend that produced the error.
        backend: &'static str,
        /// Description returned by the backend.
        message: String,
    },

    /// The backend configuration is incomplete or inconsistent.
    #[error("invalid storage configuration: {0}")]
    Config(String),

    /// The operation did not finish before its deadline.
    #[error("storage operation exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl StorageError {
    /// Creates a backend error.
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed when retried later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Backend { .. } | Self::DeadlineExceeded(_)
        )
    }
}
