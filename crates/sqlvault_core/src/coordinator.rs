//! Per-connection transaction state machine and statement routing.
//!
//! ```text
//!            BEGIN                 COMMIT fails
//!   Idle ───────────▶ Active ───────────────────▶ Failed
//!    ▲                  │                           │
//!    │   COMMIT/ROLLBACK│                           │ ROLLBACK
//!    └──────────────────┴───────────────────────────┘
//! ```
//!
//! Statements on one connection are serialized by that connection's lock.
//! Statements run against the connection's open transaction when there is
//! one, otherwise against the engine in autocommit mode.

use crate::engine::{Engine, EngineResult, EngineTransaction, StatementInfo};
use crate::error::{CoreError, CoreResult};
use crate::metrics::MetricsCollector;
use crate::registry::{ConnectionRegistry, PreparedStatement};
use crate::statement::{Control, Statement};
use crate::translate::ErrorClass;
use crate::types::{QueryResult, TransactionMode, TransactionStatus, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives notice that committed data is waiting to be persisted.
///
/// Implementations must not block; a notice that cannot be delivered
/// immediately may be dropped if an earlier one is still pending.
pub trait DirtySignal: Send + Sync {
    /// Marks the working copy as changed since the last upload.
    fn mark_dirty(&self);
}

/// Result of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The statement was empty.
    Empty,
    /// A statement that produced no rows.
    Command {
        /// PostgreSQL command tag, e.g. `INSERT 0 1`.
        tag: String,
        /// Rows changed by the statement.
        rows_affected: u64,
    },
    /// A statement that produced rows.
    Rows(QueryResult),
}

enum Target<'a> {
    Autocommit(&'a dyn Engine),
    Transaction(&'a mut (dyn EngineTransaction + 'static)),
}

impl Target<'_> {
    fn exec(&mut self, sql: &str, params: &[Value]) -> EngineResult<u64> {
        match self {
            Self::Autocommit(engine) => engine.exec(sql, params),
            Self::Transaction(tx) => tx.exec(sql, params),
        }
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> EngineResult<QueryResult> {
        match self {
            Self::Autocommit(engine) => engine.query(sql, params),
            Self::Transaction(tx) => tx.query(sql, params),
        }
    }

    fn prepare(&mut self, sql: &str) -> EngineResult<StatementInfo> {
        match self {
            Self::Autocommit(engine) => engine.prepare(sql),
            Self::Transaction(tx) => tx.prepare(sql),
        }
    }
}

fn dispatch(
    target: &mut Target<'_>,
    statement: Statement,
    sql: &str,
    params: &[Value],
) -> EngineResult<Outcome> {
    let command = |rows: u64| Outcome::Command {
        tag: statement.command_tag(sql, rows),
        rows_affected: rows,
    };
    match statement {
        Statement::Read => target.query(sql, params).map(Outcome::Rows),
        Statement::Write(_) => {
            // INSERT/UPDATE/DELETE ... RETURNING
            if target.prepare(sql)?.returns_rows() {
                target.query(sql, params).map(Outcome::Rows)
            } else {
                target.exec(sql, params).map(command)
            }
        }
        Statement::Ddl(_) | Statement::Control(_) => target.exec(sql, params).map(command),
        Statement::Unknown => match target.query(sql, params) {
            Ok(rows) if rows.columns.is_empty() => Ok(command(0)),
            Ok(rows) => Ok(Outcome::Rows(rows)),
            Err(query_err) => {
                debug!(error = %query_err, "query path rejected statement; retrying as exec");
                target.exec(sql, params).map(command)
            }
        },
    }
}

/// Drives BEGIN/COMMIT/ROLLBACK per connection and routes statements.
pub struct TransactionCoordinator {
    engine: Arc<dyn Engine>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsCollector>,
    dirty: Option<Arc<dyn DirtySignal>>,
    default_mode: TransactionMode,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("connections", &self.registry.len())
            .field("default_mode", &self.default_mode)
            .finish_non_exhaustive()
    }
}

impl TransactionCoordinator {
    /// Creates a coordinator with deferred transactions and no dirty signal.
    pub fn new(
        engine: Arc<dyn Engine>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            engine,
            registry,
            metrics,
            dirty: None,
            default_mode: TransactionMode::Deferred,
        }
    }

    /// Sets the receiver notified after each durable change.
    #[must_use]
    pub fn with_dirty_signal(mut self, signal: Arc<dyn DirtySignal>) -> Self {
        self.dirty = Some(signal);
        self
    }

    /// Sets the mode used by a bare `BEGIN`.
    #[must_use]
    pub fn with_default_mode(mut self, mode: TransactionMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Returns the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Returns the metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Returns the engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    fn signal_dirty(&self) {
        if let Some(signal) = &self.dirty {
            signal.mark_dirty();
        }
    }

    /// Runs one statement for a connection.
    ///
    /// # Errors
    ///
    /// Returns transaction misuse errors for control statements issued in the
    /// wrong state, and the translated engine error for failed statements.
    pub fn execute(&self, id: &str, sql: &str) -> CoreResult<Outcome> {
        let sql = sql.trim();
        if sql.is_empty() || sql == ";" {
            return Ok(Outcome::Empty);
        }

        let statement = Statement::classify(sql);
        let tag = |s: Statement| Outcome::Command {
            tag: s.command_tag(sql, 0),
            rows_affected: 0,
        };
        match statement {
            Statement::Control(Control::Begin(mode)) => {
                self.begin(id, mode.unwrap_or(self.default_mode))?;
                Ok(tag(statement))
            }
            Statement::Control(Control::Commit) => {
                self.commit(id)?;
                Ok(tag(statement))
            }
            Statement::Control(Control::Rollback) => {
                self.rollback(id)?;
                Ok(tag(statement))
            }
            _ => self.run(id, statement, sql, &[]),
        }
    }

    fn run(&self, id: &str, statement: Statement, sql: &str, params: &[Value]) -> CoreResult<Outcome> {
        let handle = self.registry.get_or_create(id);
        let mut state = handle.lock();
        state.touch();
        self.metrics.record_query(id);

        if state.status() == TransactionStatus::Failed {
            return Err(CoreError::TransactionFailed);
        }

        let in_transaction;
        let result = {
            let mut target = match state.transaction_mut() {
                Some(tx) => Target::Transaction(tx),
                None => Target::Autocommit(self.engine.as_ref()),
            };
            in_transaction = matches!(target, Target::Transaction(_));
            dispatch(&mut target, statement, sql, params).map_err(CoreError::from)
        };

        let wrote = match &result {
            Ok(Outcome::Command { .. }) => statement.may_write(),
            Ok(Outcome::Rows(_)) => matches!(statement, Statement::Write(_)),
            _ => false,
        };
        match &result {
            Ok(_) if wrote && !in_transaction => {
                drop(state);
                self.signal_dirty();
            }
            Err(err) if in_transaction && err.class() == ErrorClass::SerializationFailure => {
                // The snapshot is stale; nothing this transaction does can commit.
                state.mark_failed(err.class(), err.to_string());
                warn!(connection = %id, error = %err, "lock conflict inside transaction");
            }
            _ => {}
        }
        result
    }

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyInTransaction`] unless the connection is
    /// Idle, or the engine's error if the transaction cannot be opened.
    pub fn begin(&self, id: &str, mode: TransactionMode) -> CoreResult<()> {
        let handle = self.registry.get_or_create(id);
        let mut state = handle.lock();
        state.touch();
        if state.status() != TransactionStatus::Idle {
            return Err(CoreError::AlreadyInTransaction);
        }

        let transaction = self.engine.begin(mode)?;
        state.attach_transaction(transaction);
        drop(state);

        self.metrics.start_transaction(id);
        debug!(connection = %id, mode = %mode, "transaction started");
        Ok(())
    }

    /// Commits the open transaction and signals the sync engine.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoActiveTransaction`] when Idle, the error that
    /// failed the transaction when Failed, or the engine's commit error,
    /// which leaves the connection Failed.
    pub fn commit(&self, id: &str) -> CoreResult<()> {
        let handle = self
            .registry
            .get(id)
            .ok_or(CoreError::NoActiveTransaction)?;
        let mut state = handle.lock();
        state.touch();
        match state.status() {
            TransactionStatus::Idle => return Err(CoreError::NoActiveTransaction),
            TransactionStatus::Failed => {
                return Err(state.failure().map_or(
                    CoreError::TransactionFailed,
                    |(class, message)| CoreError::Engine {
                        class,
                        message: message.to_string(),
                    },
                ));
            }
            TransactionStatus::Active => {}
        }

        let Some(transaction) = state.transaction_mut() else {
            state.mark_idle();
            return Err(CoreError::NoActiveTransaction);
        };
        match transaction.commit() {
            Ok(()) => {
                state.mark_idle();
                drop(state);
                self.metrics.end_transaction(id, true);
                self.signal_dirty();
                debug!(connection = %id, "transaction committed");
                Ok(())
            }
            Err(err) => {
                let err = CoreError::from(err);
                state.mark_failed(err.class(), err.to_string());
                warn!(connection = %id, error = %err, "commit failed; rollback required");
                Err(err)
            }
        }
    }

    /// Rolls back the open or failed transaction.
    ///
    /// Engine rollback errors are logged and the connection always returns
    /// to Idle.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoActiveTransaction`] when the connection is Idle.
    pub fn rollback(&self, id: &str) -> CoreResult<()> {
        let handle = self
            .registry
            .get(id)
            .ok_or(CoreError::NoActiveTransaction)?;
        let mut state = handle.lock();
        state.touch();
        if state.status() == TransactionStatus::Idle {
            return Err(CoreError::NoActiveTransaction);
        }

        if let Some(mut transaction) = state.take_transaction() {
            if let Err(err) = transaction.rollback() {
                warn!(connection = %id, error = %err, "rollback failed; connection reset anyway");
            }
        }
        state.mark_idle();
        drop(state);

        self.metrics.end_transaction(id, false);
        debug!(connection = %id, "transaction rolled back");
        Ok(())
    }

    /// Compiles `sql` and stores it under `name`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the statement does not compile, or
    /// [`CoreError::TransactionFailed`] when the connection is Failed.
    pub fn prepare(&self, id: &str, name: &str, sql: &str) -> CoreResult<StatementInfo> {
        let sql = sql.trim();
        let handle = self.registry.get_or_create(id);
        let mut state = handle.lock();
        state.touch();
        if state.status() == TransactionStatus::Failed {
            return Err(CoreError::TransactionFailed);
        }

        let info = {
            let mut target = match state.transaction_mut() {
                Some(tx) => Target::Transaction(tx),
                None => Target::Autocommit(self.engine.as_ref()),
            };
            target.prepare(sql)?
        };
        state.insert_prepared(
            name,
            PreparedStatement {
                sql: sql.to_string(),
                info,
            },
        );
        debug!(connection = %id, statement = %name, "statement prepared");
        Ok(info)
    }

    /// Runs a prepared statement with bound parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PreparedStatementNotFound`] for unknown names,
    /// otherwise the same errors as [`Self::execute`].
    pub fn execute_prepared(&self, id: &str, name: &str, params: &[Value]) -> CoreResult<Outcome> {
        let prepared = {
            let handle = self.registry.get_or_create(id);
            let state = handle.lock();
            state
                .prepared(name)
                .cloned()
                .ok_or_else(|| CoreError::PreparedStatementNotFound(name.to_string()))?
        };

        let statement = Statement::classify(&prepared.sql);
        if let Statement::Control(_) = statement {
            return self.execute(id, &prepared.sql);
        }
        self.run(id, statement, &prepared.sql, params)
    }

    /// Closes a prepared statement. Unknown names are ignored.
    pub fn close_prepared(&self, id: &str, name: &str) {
        if let Some(handle) = self.registry.get(id) {
            handle.lock().remove_prepared(name);
        }
    }

    /// Returns the transaction status of a connection.
    #[must_use]
    pub fn status(&self, id: &str) -> TransactionStatus {
        self.registry
            .get(id)
            .map_or(TransactionStatus::Idle, |handle| handle.lock().status())
    }

    /// Forgets a connection, rolling back anything it left open.
    pub fn disconnect(&self, id: &str) {
        if let Some(removed) = self.registry.remove(id) {
            if removed.rolled_back {
                self.metrics.end_transaction(id, false);
                info!(connection = %id, "open transaction rolled back on disconnect");
            }
        }
    }

    /// Evicts every connection, rolling back open transactions.
    pub fn shutdown(&self) {
        let removed = self.registry.remove_all();
        let mut rolled_back = 0usize;
        for (id, released) in &removed {
            if released.rolled_back {
                rolled_back += 1;
                self.metrics.end_transaction(id, false);
            }
        }
        info!(
            connections = removed.len(),
            rolled_back, "coordinator shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Script {
        fail_commit: AtomicBool,
        fail_query: AtomicBool,
        execs: Mutex<Vec<String>>,
        queries: AtomicUsize,
    }

    struct ScriptedEngine(Arc<Script>);
    struct ScriptedTransaction(Arc<Script>, TransactionMode);

    fn locked() -> EngineError {
        EngineError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ))
    }

    impl Engine for ScriptedEngine {
        fn begin(&self, mode: TransactionMode) -> EngineResult<Box<dyn EngineTransaction>> {
            Ok(Box::new(ScriptedTransaction(Arc::clone(&self.0), mode)))
        }
        fn exec(&self, sql: &str, _: &[Value]) -> EngineResult<u64> {
            self.0.execs.lock().push(sql.to_string());
            Ok(1)
        }
        fn query(&self, _: &str, _: &[Value]) -> EngineResult<QueryResult> {
            self.0.queries.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_query.load(Ordering::SeqCst) {
                return Err(locked());
            }
            Ok(QueryResult::default())
        }
        fn prepare(&self, _: &str) -> EngineResult<StatementInfo> {
            Ok(StatementInfo::default())
        }
        fn snapshot(&self, _: &Path) -> EngineResult<u64> {
            Ok(0)
        }
        fn close(&self) -> EngineResult<()> {
            Ok(())
        }
    }

    impl EngineTransaction for ScriptedTransaction {
        fn mode(&self) -> TransactionMode {
            self.1
        }
        fn exec(&mut self, _: &str, _: &[Value]) -> EngineResult<u64> {
            Err(locked())
        }
        fn query(&mut self, _: &str, _: &[Value]) -> EngineResult<QueryResult> {
            Ok(QueryResult::default())
        }
        fn prepare(&mut self, _: &str) -> EngineResult<StatementInfo> {
            Ok(StatementInfo::default())
        }
        fn commit(&mut self) -> EngineResult<()> {
            if self.0.fail_commit.load(Ordering::SeqCst) {
                Err(locked())
            } else {
                Ok(())
            }
        }
        fn rollback(&mut self) -> EngineResult<()> {
            Err(EngineError::Closed)
        }
    }

    #[derive(Default)]
    struct CountingSignal(AtomicUsize);

    impl DirtySignal for CountingSignal {
        fn mark_dirty(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn coordinator() -> (Arc<Script>, Arc<CountingSignal>, TransactionCoordinator) {
        let script = Arc::new(Script::default());
        let signal = Arc::new(CountingSignal::default());
        let coordinator = TransactionCoordinator::new(
            Arc::new(ScriptedEngine(Arc::clone(&script))),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(MetricsCollector::new()),
        )
        .with_dirty_signal(signal.clone());
        (script, signal, coordinator)
    }

    #[test]
    fn empty_statement() {
        let (_, _, coordinator) = coordinator();
        assert_eq!(coordinator.execute("c", "  ").unwrap(), Outcome::Empty);
        assert_eq!(coordinator.execute("c", ";").unwrap(), Outcome::Empty);
    }

    #[test]
    fn failed_commit_requires_rollback() {
        let (script, signal, coordinator) = coordinator();
        coordinator.execute("c", "BEGIN").unwrap();
        script.fail_commit.store(true, Ordering::SeqCst);

        let err = coordinator.execute("c", "COMMIT").unwrap_err();
        assert_eq!(err.class(), ErrorClass::SerializationFailure);
        assert_eq!(coordinator.status("c"), TransactionStatus::Failed);
        assert_eq!(signal.0.load(Ordering::SeqCst), 0);

        assert!(matches!(
            coordinator.execute("c", "SELECT 1"),
            Err(CoreError::TransactionFailed)
        ));
        // COMMIT keeps reporting why the transaction cannot commit
        let err = coordinator.execute("c", "COMMIT").unwrap_err();
        assert_eq!(err.sqlstate(), "40001");
        assert!(matches!(
            coordinator.execute("c", "BEGIN"),
            Err(CoreError::AlreadyInTransaction)
        ));

        // rollback errors from the engine are swallowed
        coordinator.execute("c", "ROLLBACK").unwrap();
        assert_eq!(coordinator.status("c"), TransactionStatus::Idle);
        assert_eq!(coordinator.metrics().snapshot().rolled_back, 1);
    }

    #[test]
    fn lock_conflict_inside_transaction_fails_it() {
        let (_, _, coordinator) = coordinator();
        coordinator.execute("c", "BEGIN").unwrap();
        let err = coordinator.execute("c", "INSERT INTO t VALUES (1)").unwrap_err();
        assert_eq!(err.sqlstate(), "40001");
        assert_eq!(coordinator.status("c"), TransactionStatus::Failed);
        coordinator.execute("c", "ROLLBACK").unwrap();
    }

    #[test]
    fn commit_signals_dirty() {
        let (_, signal, coordinator) = coordinator();
        coordinator.execute("c", "BEGIN").unwrap();
        coordinator.execute("c", "COMMIT").unwrap();
        assert_eq!(signal.0.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.metrics().snapshot().committed, 1);
    }

    #[test]
    fn autocommit_write_signals_dirty_but_read_does_not() {
        let (_, signal, coordinator) = coordinator();
        coordinator.execute("c", "SELECT 1").unwrap();
        assert_eq!(signal.0.load(Ordering::SeqCst), 0);
        let outcome = coordinator.execute("c", "insert into t values (1)").unwrap();
        assert_eq!(
            outcome,
            Outcome::Command {
                tag: "INSERT 0 1".into(),
                rows_affected: 1
            }
        );
        assert_eq!(signal.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_statement_falls_back_to_exec() {
        let (script, _, coordinator) = coordinator();
        script.fail_query.store(true, Ordering::SeqCst);
        let outcome = coordinator.execute("c", "VACUUM").unwrap();
        assert!(matches!(outcome, Outcome::Command { ref tag, .. } if tag == "VACUUM"));
        assert_eq!(script.queries.load(Ordering::SeqCst), 1);
        assert_eq!(script.execs.lock().as_slice(), ["VACUUM".to_string()]);
    }

    #[test]
    fn misuse_on_idle_connection() {
        let (_, _, coordinator) = coordinator();
        assert!(matches!(
            coordinator.execute("c", "COMMIT"),
            Err(CoreError::NoActiveTransaction)
        ));
        assert!(matches!(
            coordinator.execute("c", "ROLLBACK"),
            Err(CoreError::NoActiveTransaction)
        ));
        assert_eq!(coordinator.metrics().snapshot(), Default::default());
    }

    #[test]
    fn begin_uses_configured_default_mode() {
        let (_, _, coordinator) = coordinator();
        let coordinator = coordinator.with_default_mode(TransactionMode::Immediate);
        coordinator.execute("c", "BEGIN").unwrap();
        let handle = coordinator.registry().get("c").unwrap();
        let mut state = handle.lock();
        assert_eq!(
            state.transaction_mut().map(|tx| tx.mode()),
            Some(TransactionMode::Immediate)
        );
        drop(state);
        coordinator.execute("c", "ROLLBACK").unwrap();
        coordinator.execute("c", "BEGIN EXCLUSIVE").unwrap();
        let mut state = handle.lock();
        assert_eq!(
            state.transaction_mut().map(|tx| tx.mode()),
            Some(TransactionMode::Exclusive)
        );
    }

    #[test]
    fn disconnect_records_rollback() {
        let (_, _, coordinator) = coordinator();
        coordinator.execute("c", "BEGIN").unwrap();
        coordinator.disconnect("c");
        assert!(coordinator.registry().is_empty());
        let snapshot = coordinator.metrics().snapshot();
        assert_eq!(snapshot.rolled_back, 1);
        assert_eq!(snapshot.active, 0);
    }

    #[test]
    fn prepared_statement_lifecycle() {
        let (_, _, coordinator) = coordinator();
        coordinator.prepare("c", "q", "SELECT 1").unwrap();
        assert!(matches!(
            coordinator.execute_prepared("c", "q", &[]).unwrap(),
            Outcome::Rows(_)
        ));
        coordinator.close_prepared("c", "q");
        coordinator.close_prepared("c", "q");
        assert!(matches!(
            coordinator.execute_prepared("c", "q", &[]),
            Err(CoreError::PreparedStatementNotFound(_))
        ));
    }
}
