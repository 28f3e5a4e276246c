//! Per-connection state and the registry that owns it.
//!
//! ## Lock discipline
//!
//! - The registry's `RwLock` protects map membership only.
//! - Each [`ConnectionState`] sits behind its own `Mutex`; all work on one
//!   connection (begin, commit, statements, prepare) is serialized on it.
//! - The registry lock is never held while an entry lock is taken, so a slow
//!   statement on one connection never blocks lookups for another.

use crate::engine::{EngineTransaction, StatementInfo};
use crate::translate::ErrorClass;
use crate::types::TransactionStatus;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A statement prepared under a name on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// SQL text.
    pub sql: String,
    /// Shape validated at prepare time.
    pub info: StatementInfo,
}

/// Mutable state of one client connection.
pub struct ConnectionState {
    id: String,
    transaction: Option<Box<dyn EngineTransaction>>,
    status: TransactionStatus,
    failure: Option<(ErrorClass, String)>,
    prepared: HashMap<String, PreparedStatement>,
    created_at: Instant,
    last_activity: Instant,
    query_count: u64,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("prepared", &self.prepared.len())
            .field("query_count", &self.query_count)
            .finish_non_exhaustive()
    }
}

impl ConnectionState {
    fn new(id: &str) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            transaction: None,
            status: TransactionStatus::Idle,
            failure: None,
            prepared: HashMap::new(),
            created_at: now,
            last_activity: now,
            query_count: 0,
        }
    }

    /// Returns the connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the transaction status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Returns when the connection was first seen.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns when the connection last ran a statement.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Returns the number of statements run on this connection.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.query_count
    }

    /// Records a statement.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.query_count += 1;
    }

    /// Installs a freshly opened transaction and moves to Active.
    ///
    /// The caller must have checked that the connection is Idle.
    pub fn attach_transaction(&mut self, transaction: Box<dyn EngineTransaction>) {
        debug_assert!(self.transaction.is_none());
        self.transaction = Some(transaction);
        self.status = TransactionStatus::Active;
    }

    /// Returns the open transaction, if any.
    pub fn transaction_mut(&mut self) -> Option<&mut (dyn EngineTransaction + 'static)> {
        self.transaction.as_deref_mut()
    }

    /// Removes the transaction handle without touching the status.
    pub fn take_transaction(&mut self) -> Option<Box<dyn EngineTransaction>> {
        self.transaction.take()
    }

    /// Marks the transaction failed with the error that doomed it. Only
    /// ROLLBACK leaves this state.
    pub fn mark_failed(&mut self, class: ErrorClass, message: impl Into<String>) {
        self.status = TransactionStatus::Failed;
        self.failure = Some((class, message.into()));
    }

    /// Returns the error that moved the transaction to Failed.
    #[must_use]
    pub fn failure(&self) -> Option<(ErrorClass, &str)> {
        self.failure
            .as_ref()
            .map(|(class, message)| (*class, message.as_str()))
    }

    /// Drops any transaction handle and returns to Idle.
    pub fn mark_idle(&mut self) {
        self.transaction = None;
        self.status = TransactionStatus::Idle;
        self.failure = None;
    }

    /// Looks up a prepared statement.
    #[must_use]
    pub fn prepared(&self, name: &str) -> Option<&PreparedStatement> {
        self.prepared.get(name)
    }

    /// Stores a prepared statement, replacing one with the same name.
    pub fn insert_prepared(&mut self, name: impl Into<String>, statement: PreparedStatement) {
        self.prepared.insert(name.into(), statement);
    }

    /// Removes a prepared statement. Unknown names are ignored.
    pub fn remove_prepared(&mut self, name: &str) -> bool {
        self.prepared.remove(name).is_some()
    }

    /// Returns the number of prepared statements.
    #[must_use]
    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }

    /// Closes every prepared statement and rolls back any open transaction.
    ///
    /// Rollback errors are logged, never returned. Returns what was released.
    pub fn release(&mut self) -> RemovedConnection {
        let statements_closed = self.prepared.len();
        self.prepared.clear();

        let had_transaction = self.status != TransactionStatus::Idle;
        if let Some(mut transaction) = self.transaction.take() {
            if let Err(err) = transaction.rollback() {
                warn!(connection = %self.id, error = %err, "rollback during release failed");
            }
        }
        self.status = TransactionStatus::Idle;
        self.failure = None;

        RemovedConnection {
            statements_closed,
            rolled_back: had_transaction,
        }
    }
}

/// Shared handle to one connection's state.
pub type ConnectionHandle = Arc<Mutex<ConnectionState>>;

/// What was released when a connection left the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedConnection {
    /// Number of prepared statements closed.
    pub statements_closed: usize,
    /// Whether an open or failed transaction was rolled back.
    pub rolled_back: bool,
}

/// Concurrency-safe directory of connection state.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state for `id`, creating it on first use.
    pub fn get_or_create(&self, id: &str) -> ConnectionHandle {
        if let Some(handle) = self.connections.read().get(id) {
            return Arc::clone(handle);
        }
        let mut connections = self.connections.write();
        let handle = connections.entry(id.to_string()).or_insert_with(|| {
            debug!(connection = %id, "connection registered");
            Arc::new(Mutex::new(ConnectionState::new(id)))
        });
        Arc::clone(handle)
    }

    /// Returns the state for `id` if it exists.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.read().get(id).cloned()
    }

    /// Evicts `id`, closing its statements and rolling back its transaction.
    ///
    /// The entry leaves the map first, then its resources are released under
    /// the entry lock, which waits for any statement still running on it.
    /// Returns `None` if the id was unknown.
    pub fn remove(&self, id: &str) -> Option<RemovedConnection> {
        let handle = self.connections.write().remove(id)?;
        let removed = handle.lock().release();
        debug!(
            connection = %id,
            statements = removed.statements_closed,
            rolled_back = removed.rolled_back,
            "connection removed"
        );
        Some(removed)
    }

    /// Evicts every connection. Returns the ids with what each released.
    pub fn remove_all(&self) -> Vec<(String, RemovedConnection)> {
        let drained: Vec<(String, ConnectionHandle)> =
            self.connections.write().drain().collect();
        drained
            .into_iter()
            .map(|(id, handle)| {
                let removed = handle.lock().release();
                (id, removed)
            })
            .collect()
    }

    /// Returns the number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns true if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Returns the registered connection ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
