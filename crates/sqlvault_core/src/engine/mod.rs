//! Embedded engine contract.
//!
//! The coordinator never talks to SQLite directly. It sees an [`Engine`]
//! that runs autocommit statements and opens transactions, and an
//! [`EngineTransaction`] that owns one connection for the life of a
//! transaction.

mod pool;
mod sqlite;

use crate::types::{QueryResult, TransactionMode, Value};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use sqlite::SqliteEngine;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// SQLite rejected the operation.
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No connection was released within the acquire timeout.
    #[error("connection pool exhausted after {0:?}")]
    PoolExhausted(Duration),

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,

    /// A snapshot file could not be prepared.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    /// The database stayed locked for the whole snapshot retry window.
    #[error("database is locked; snapshot abandoned")]
    SnapshotBusy,
}

/// Shape of a prepared statement, validated at prepare time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementInfo {
    /// Number of bind parameters.
    pub parameter_count: usize,
    /// Number of result columns; zero for statements that return no rows.
    pub column_count: usize,
}

impl StatementInfo {
    /// Returns true if executing the statement produces rows.
    #[must_use]
    pub const fn returns_rows(&self) -> bool {
        self.column_count > 0
    }
}

/// An embedded relational engine shared by all connections.
///
/// Methods on the engine itself run in autocommit mode.
pub trait Engine: Send + Sync {
    /// Opens a transaction on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Fails if no connection is available or the engine cannot take the
    /// requested lock.
    fn begin(&self, mode: TransactionMode) -> EngineResult<Box<dyn EngineTransaction>>;

    /// Runs a statement that returns no rows. Returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the statement.
    fn exec(&self, sql: &str, params: &[Value]) -> EngineResult<u64>;

    /// Runs a statement and collects its rows.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the statement.
    fn query(&self, sql: &str, params: &[Value]) -> EngineResult<QueryResult>;

    /// Compiles a statement without running it.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the statement does not compile.
    fn prepare(&self, sql: &str) -> EngineResult<StatementInfo>;

    /// Writes a consistent copy of the committed database to `dest`,
    /// replacing any file already there. Returns the size of the copy.
    ///
    /// The copy reflects one committed state, including changes still in
    /// the write-ahead log, and is unaffected by concurrent readers or
    /// writers.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the copy could not be taken.
    fn snapshot(&self, dest: &Path) -> EngineResult<u64>;

    /// Closes all idle connections and refuses new work.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection fails to close cleanly.
    fn close(&self) -> EngineResult<()>;
}

/// An open transaction bound to one connection.
///
/// Dropping an unfinished transaction rolls it back.
pub trait EngineTransaction: Send {
    /// Returns the mode the transaction was opened with.
    fn mode(&self) -> TransactionMode;

    /// Runs a statement that returns no rows inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the statement.
    fn exec(&mut self, sql: &str, params: &[Value]) -> EngineResult<u64>;

    /// Runs a statement and collects its rows inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the statement.
    fn query(&mut self, sql: &str, params: &[Value]) -> EngineResult<QueryResult>;

    /// Compiles a statement on the transaction's connection.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the statement does not compile.
    fn prepare(&mut self, sql: &str) -> EngineResult<StatementInfo>;

    /// Commits. On failure the transaction stays open so it can be rolled back.
    ///
    /// # Errors
    ///
    /// Returns the engine's commit error.
    fn commit(&mut self) -> EngineResult<()>;

    /// Rolls back and releases the connection.
    ///
    /// # Errors
    ///
    /// Returns the engine's rollback error. The connection is released either way.
    fn rollback(&mut self) -> EngineResult<()>;
}
