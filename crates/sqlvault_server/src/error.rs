//! Error types for the server.

use crate::config::ConfigError;
use sqlvault_core::EngineError;
use sqlvault_storage::StorageError;
use sqlvault_sync::SyncError;
use std::io;
use thiserror::Error;

/// Result type for server startup and shutdown.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that stop the server from starting or shutting down cleanly.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded or is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The blob store could not be constructed.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// The working copy could not be hydrated.
    #[error("cache: {0}")]
    Sync(#[from] SyncError),

    /// The working copy could not be opened as a database.
    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    /// Binding or another socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A spawned task panicked.
    #[error("task failed: {0}")]
    Task(String),
}
