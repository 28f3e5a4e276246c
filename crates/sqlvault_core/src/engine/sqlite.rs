//! SQLite engine backed by rusqlite.

use super::pool::{ConnectionPool, PooledConnection};
use super::{Engine, EngineError, EngineResult, EngineTransaction, StatementInfo};
use crate::config::EngineConfig;
use crate::types::{Column, QueryResult, TransactionMode, Value};
use rusqlite::backup::{Backup, StepResult};
use rusqlite::{params_from_iter, Connection};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SNAPSHOT_RETRIES: u32 = 50;
const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// The SQLite working copy, shared by every client connection.
///
/// The database runs in WAL mode so readers do not block the single writer.
/// Autocommit statements borrow a pooled connection for one statement;
/// transactions hold theirs until they finish.
pub struct SqliteEngine {
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("path", &self.pool.path())
            .finish_non_exhaustive()
    }
}

impl SqliteEngine {
    /// Opens the database at `path`, creating it if it does not exist.
    ///
    /// One connection is opened eagerly so a bad path or a damaged file is
    /// reported here rather than on the first client statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened as a SQLite database.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> EngineResult<Self> {
        let pool = Arc::new(ConnectionPool::new(path.as_ref(), config));
        {
            let conn = pool.acquire()?;
            conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))?;
        }
        debug!(path = %path.as_ref().display(), "sqlite engine opened");
        Ok(Self { pool })
    }
}

fn exec_on(conn: &Connection, sql: &str, params: &[Value]) -> EngineResult<u64> {
    let mut stmt = conn.prepare_cached(sql)?;
    if stmt.column_count() == 0 {
        let affected = stmt.execute(params_from_iter(params.iter()))?;
        return Ok(affected as u64);
    }
    // Row-producing writes apply their change while stepping; run them to
    // completion and discard the rows.
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    while rows.next()?.is_some() {}
    drop(rows);
    Ok(conn.changes())
}

fn query_on(conn: &Connection, sql: &str, params: &[Value]) -> EngineResult<QueryResult> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<Column> = stmt
        .columns()
        .iter()
        .map(|c| Column::new(c.name(), c.decl_type()))
        .collect();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for index in 0..width {
            values.push(row.get::<_, Value>(index)?);
        }
        out.push(values);
    }
    Ok(QueryResult { columns, rows: out })
}

fn prepare_on(conn: &Connection, sql: &str) -> EngineResult<StatementInfo> {
    let stmt = conn.prepare_cached(sql)?;
    Ok(StatementInfo {
        parameter_count: stmt.parameter_count(),
        column_count: stmt.column_count(),
    })
}

impl Engine for SqliteEngine {
    fn begin(&self, mode: TransactionMode) -> EngineResult<Box<dyn EngineTransaction>> {
        let conn = self.pool.acquire()?;
        conn.execute_batch(mode.begin_sql())?;
        Ok(Box::new(SqliteTransaction {
            conn: Some(conn),
            mode,
        }))
    }

    fn exec(&self, sql: &str, params: &[Value]) -> EngineResult<u64> {
        let conn = self.pool.acquire()?;
        exec_on(&conn, sql, params)
    }

    fn query(&self, sql: &str, params: &[Value]) -> EngineResult<QueryResult> {
        let conn = self.pool.acquire()?;
        query_on(&conn, sql, params)
    }

    fn prepare(&self, sql: &str) -> EngineResult<StatementInfo> {
        let conn = self.pool.acquire()?;
        prepare_on(&conn, sql)
    }

    fn snapshot(&self, dest: &Path) -> EngineResult<u64> {
        let conn = self.pool.acquire()?;
        match std::fs::remove_file(dest) {
            Ok(()) => debug!(path = %dest.display(), "removed stale snapshot"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut target = Connection::open(dest)?;
        {
            let backup = Backup::new(&conn, &mut target)?;
            let mut attempts = 0u32;
            // A negative page count copies the whole database in one read
            // transaction, so the copy is a single committed state.
            loop {
                match backup.step(-1)? {
                    StepResult::Done => break,
                    StepResult::More => {}
                    StepResult::Busy | StepResult::Locked | _ => {
                        attempts += 1;
                        if attempts > SNAPSHOT_RETRIES {
                            return Err(EngineError::SnapshotBusy);
                        }
                        std::thread::sleep(SNAPSHOT_RETRY_DELAY);
                    }
                }
            }
        }
        drop(conn);
        target.close().map_err(|(_, e)| e)?;

        let bytes = std::fs::metadata(dest)?.len();
        debug!(path = %dest.display(), bytes, "snapshot written");
        Ok(bytes)
    }

    fn close(&self) -> EngineResult<()> {
        self.pool.close()
    }
}

/// A transaction holding one pooled connection.
struct SqliteTransaction {
    conn: Option<PooledConnection>,
    mode: TransactionMode,
}

impl SqliteTransaction {
    fn conn(&self) -> EngineResult<&PooledConnection> {
        self.conn.as_ref().ok_or(EngineError::Closed)
    }
}

impl EngineTransaction for SqliteTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn exec(&mut self, sql: &str, params: &[Value]) -> EngineResult<u64> {
        exec_on(self.conn()?, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> EngineResult<QueryResult> {
        query_on(self.conn()?, sql, params)
    }

    fn prepare(&mut self, sql: &str) -> EngineResult<StatementInfo> {
        prepare_on(self.conn()?, sql)
    }

    fn commit(&mut self) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute_batch("COMMIT")?;
        self.conn = None;
        Ok(())
    }

    fn rollback(&mut self) -> EngineResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        let result = conn.execute_batch("ROLLBACK");
        if conn.is_autocommit() {
            drop(conn);
        } else {
            warn!("rollback left connection inside a transaction; discarding it");
            conn.discard();
        }
        result.map_err(EngineError::from)
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(err) = self.rollback() {
                warn!(error = %err, "rollback of abandoned transaction failed");
            }
        }
    }
}
