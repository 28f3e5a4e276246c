//! Error types for sqlvault core.

use crate::engine::EngineError;
use crate::translate::{translate, ErrorClass};
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// BEGIN issued while a transaction is open.
    #[error("there is already a transaction in progress")]
    AlreadyInTransaction,

    /// COMMIT or ROLLBACK issued with no transaction open.
    #[error("there is no transaction in progress")]
    NoActiveTransaction,

    /// Statement issued after a failed COMMIT.
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    TransactionFailed,

    /// The engine rejected a statement.
    #[error("{message}")]
    Engine {
        /// Translated error class.
        class: ErrorClass,
        /// Message reported by the engine.
        message: String,
    },

    /// No prepared statement with this name exists on the connection.
    #[error("prepared statement \"{0}\" does not exist")]
    PreparedStatementNotFound(String),

    /// No pooled connection became available in time.
    #[error("connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    /// The engine has been closed.
    #[error("database is closed")]
    Closed,

    /// Unknown transaction mode name.
    #[error("invalid transaction mode: {0:?}")]
    InvalidMode(String),
}

impl CoreError {
    /// Creates an engine error, classifying the message.
    pub fn engine(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Engine {
            class: translate(&message),
            message,
        }
    }

    /// Returns the client-visible error class.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyInTransaction => ErrorClass::ActiveTransaction,
            Self::NoActiveTransaction => ErrorClass::NoActiveTransaction,
            Self::TransactionFailed => ErrorClass::InFailedTransaction,
            Self::Engine { class, .. } => *class,
            Self::PreparedStatementNotFound(_) => ErrorClass::UndefinedStatement,
            Self::PoolExhausted(_) => ErrorClass::TooManyConnections,
            Self::Closed => ErrorClass::AdminShutdown,
            Self::InvalidMode(_) => ErrorClass::SyntaxError,
        }
    }

    /// Returns the PostgreSQL SQLSTATE code for this error.
    #[must_use]
    pub fn sqlstate(&self) -> &'static str {
        self.class().sqlstate()
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Sqlite(e) => Self::engine(e.to_string()),
            EngineError::PoolExhausted(waited) => Self::PoolExhausted(waited),
            EngineError::Closed => Self::Closed,
            err @ (EngineError::Io(_) | EngineError::SnapshotBusy) => Self::engine(err.to_string()),
        }
    }
}
