//! Bounded pool of SQLite connections.
//!
//! At most `pool_size` connections are open at once. A caller that finds
//! the pool at capacity waits on a condition variable until a connection is
//! returned or the acquire timeout passes.

use crate::config::EngineConfig;
use crate::engine::{EngineError, EngineResult};
use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
    closed: bool,
}

pub(crate) struct ConnectionPool {
    path: PathBuf,
    config: EngineConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl ConnectionPool {
    pub(crate) fn new(path: &Path, config: EngineConfig) -> Self {
        Self {
            path: path.to_path_buf(),
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                closed: false,
            }),
            released: Condvar::new(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> EngineResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::default())?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.set_prepared_statement_cache_capacity(self.config.statement_cache_capacity);
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(path = %self.path.display(), journal_mode = %mode, "WAL mode not available");
        }
        conn.pragma_update(None, "foreign_keys", self.config.foreign_keys)?;
        Ok(conn)
    }

    /// Checks out a connection, opening a new one while under capacity.
    pub(crate) fn acquire(self: &Arc<Self>) -> EngineResult<PooledConnection> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(EngineError::Closed);
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection::new(conn, Arc::clone(self)));
            }
            if state.open < self.config.pool_size {
                state.open += 1;
                drop(state);
                return match self.connect() {
                    Ok(conn) => Ok(PooledConnection::new(conn, Arc::clone(self))),
                    Err(err) => {
                        self.forget();
                        Err(err)
                    }
                };
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return Err(EngineError::PoolExhausted(self.config.acquire_timeout));
            }
        }
    }

    /// Accounts for a connection that will not come back.
    fn forget(&self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }

    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        if state.closed || state.idle.len() >= self.config.max_idle() {
            state.open = state.open.saturating_sub(1);
            drop(state);
            drop(conn);
        } else {
            state.idle.push(conn);
            drop(state);
        }
        self.released.notify_one();
    }

    /// Closes idle connections and makes future acquires fail.
    pub(crate) fn close(&self) -> EngineResult<()> {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            state.open = state.open.saturating_sub(state.idle.len());
            std::mem::take(&mut state.idle)
        };
        self.released.notify_all();

        let count = idle.len();
        for conn in idle {
            conn.close().map_err(|(_, err)| EngineError::Sqlite(err))?;
        }
        debug!(closed = count, "connection pool closed");
        Ok(())
    }
}

/// A checked-out connection. Returns itself to the pool on drop.
pub(crate) struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<ConnectionPool>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Drops the connection instead of returning it to the pool.
    pub(crate) fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.forget();
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !conn.is_autocommit() {
            // A connection must never re-enter the pool mid-transaction.
            let _ = conn.execute_batch("ROLLBACK");
            if !conn.is_autocommit() {
                self.pool.forget();
                return;
            }
        }
        self.pool.release(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn pool(dir: &Path, size: usize) -> Arc<ConnectionPool> {
        let config = EngineConfig::new()
            .pool_size(size)
            .acquire_timeout(Duration::from_millis(50));
        Arc::new(ConnectionPool::new(&dir.join("pool.sqlite"), config))
    }

    #[test]
    fn pool_reuses_connections() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 2);
        {
            let conn = pool.acquire().unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        }
        let conn = pool.acquire().unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(pool.state.lock().open, 1);
    }

    #[test]
    fn pool_times_out_when_exhausted() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 1);
        let _held = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(EngineError::PoolExhausted(_))));
    }

    #[test]
    fn pool_uses_wal() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 1);
        let conn = pool.acquire().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
    }

    #[test]
    fn open_transaction_is_rolled_back_on_return() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 1);
        pool.acquire()
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();
        {
            let conn = pool.acquire().unwrap();
            conn.execute_batch("BEGIN; INSERT INTO t VALUES (1);").unwrap();
        }
        let conn = pool.acquire().unwrap();
        assert!(conn.is_autocommit());
        let count: i64 = conn
            .query_row("SELECT count(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn closed_pool_rejects_acquire() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 2);
        drop(pool.acquire().unwrap());
        pool.close().unwrap();
        assert!(matches!(pool.acquire(), Err(EngineError::Closed)));
    }

    #[test]
    fn discard_frees_capacity() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 1);
        pool.acquire().unwrap().discard();
        assert!(pool.acquire().is_ok());
    }
}
