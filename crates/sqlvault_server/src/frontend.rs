//! TCP frontend: accepts clients and feeds their statements to the coordinator.

use crate::protocol::{
    format_core_error, format_error, format_outcome, parse_request, Request,
};
use sqlvault_core::{ErrorClass, TransactionCoordinator};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Accepted principal.
#[derive(Clone)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    /// Creates the credential pair clients must present.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    fn accepts(&self, user: &str, password: &str) -> bool {
        self.user == user && self.password == password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Serves the line protocol on a bound listener.
pub struct Frontend {
    listener: TcpListener,
    coordinator: Arc<TransactionCoordinator>,
    credentials: Credentials,
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("addr", &self.listener.local_addr().ok())
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Frontend {
    /// Binds `addr`.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn bind(
        addr: &str,
        coordinator: Arc<TransactionCoordinator>,
        credentials: Credentials,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            coordinator,
            credentials,
        })
    }

    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `shutdown` turns true, then waits up to
    /// `drain_timeout` for open sessions to end.
    ///
    /// Sessions see the same signal and stop after their current statement.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>, drain_timeout: Duration) {
        info!(addr = ?self.listener.local_addr().ok(), "accepting connections");
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client connected");
                        let session = Session {
                            coordinator: Arc::clone(&self.coordinator),
                            credentials: self.credentials.clone(),
                            peer,
                        };
                        sessions.spawn(session.run(stream, shutdown.clone()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "session task failed");
                    }
                }
            }
        }

        info!(open = sessions.len(), "no longer accepting connections");
        let drained = tokio::time::timeout(drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(open = sessions.len(), "sessions still open after drain timeout; aborting");
            sessions.shutdown().await;
        }
    }
}

struct Session {
    coordinator: Arc<TransactionCoordinator>,
    credentials: Credentials,
    peer: SocketAddr,
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, lines: &[String]) -> io::Result<()> {
    for line in lines {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}

impl Session {
    async fn run(self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let first = tokio::select! {
            _ = shutdown.changed() => return,
            line = lines.next_line() => line,
        };
        let user = match first.map(|line| line.map(|l| parse_request(&l))) {
            Ok(Some(Ok(Request::Auth { user, password })))
                if self.credentials.accepts(&user, &password) =>
            {
                user
            }
            Ok(Some(Ok(Request::Auth { user, .. }))) => {
                warn!(peer = %self.peer, %user, "authentication failed");
                let line = format_error(
                    ErrorClass::InvalidPassword,
                    &format!("password authentication failed for user \"{user}\""),
                );
                let _ = send(&mut writer, &[line]).await;
                return;
            }
            Ok(Some(_)) => {
                let line = format_error(ErrorClass::InvalidPassword, "expected AUTH <user> <password>");
                let _ = send(&mut writer, &[line]).await;
                return;
            }
            Ok(None) | Err(_) => return,
        };

        let id = format!("{user}@{}", self.peer);
        if send(&mut writer, &["OK AUTH".to_string()]).await.is_err() {
            return;
        }
        info!(connection = %id, "session started");

        loop {
            let line = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    let line = format_error(ErrorClass::AdminShutdown, "terminating connection due to server shutdown");
                    let _ = send(&mut writer, &[line]).await;
                    break;
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(connection = %id, error = %e, "read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let request = match parse_request(&line) {
                Ok(Request::Quit) => {
                    let _ = send(&mut writer, &["OK BYE".to_string()]).await;
                    break;
                }
                Ok(request) => request,
                Err(e) => {
                    let reply = [format_error(ErrorClass::SyntaxError, &e.to_string())];
                    if send(&mut writer, &reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let coordinator = Arc::clone(&self.coordinator);
            let conn = id.clone();
            let reply = tokio::task::spawn_blocking(move || dispatch(&coordinator, &conn, request))
                .await
                .unwrap_or_else(|e| vec![format_error(ErrorClass::Internal, &e.to_string())]);
            if send(&mut writer, &reply).await.is_err() {
                break;
            }
        }

        let coordinator = Arc::clone(&self.coordinator);
        let conn = id.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || coordinator.disconnect(&conn)).await {
            warn!(connection = %id, error = %e, "disconnect task failed");
        }
        info!(connection = %id, "session ended");
    }
}

/// Runs one request and renders the reply.
pub(crate) fn dispatch(coordinator: &TransactionCoordinator, id: &str, request: Request) -> Vec<String> {
    match request {
        Request::Query(sql) => match coordinator.execute(id, &sql) {
            Ok(outcome) => format_outcome(&outcome),
            Err(e) => vec![format_core_error(&e)],
        },
        Request::Prepare { name, sql } => match coordinator.prepare(id, &name, &sql) {
            Ok(info) => vec![format!("OK PREPARE {name} {}", info.parameter_count)],
            Err(e) => vec![format_core_error(&e)],
        },
        Request::Execute { name, params } => {
            match coordinator.execute_prepared(id, &name, &params) {
                Ok(outcome) => format_outcome(&outcome),
                Err(e) => vec![format_core_error(&e)],
            }
        }
        Request::Close { name } => {
            coordinator.close_prepared(id, &name);
            vec!["OK CLOSE".to_string()]
        }
        Request::Auth { .. } => vec![format_error(
            ErrorClass::SyntaxError,
            "already authenticated",
        )],
        Request::Quit => vec!["OK BYE".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlvault_core::{ConnectionRegistry, EngineConfig, MetricsCollector, SqliteEngine};
    use tempfile::{tempdir, TempDir};

    fn coordinator() -> (TempDir, TransactionCoordinator) {
        let dir = tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path().join("f.sqlite"), EngineConfig::default()).unwrap();
        let coordinator = TransactionCoordinator::new(
            Arc::new(engine),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(MetricsCollector::new()),
        );
        (dir, coordinator)
    }

    fn run(coordinator: &TransactionCoordinator, line: &str) -> Vec<String> {
        dispatch(coordinator, "u@test", parse_request(line).unwrap())
    }

    #[test]
    fn dispatch_round() {
        let (_dir, coordinator) = coordinator();
        assert_eq!(run(&coordinator, "CREATE TABLE t (id INTEGER, name TEXT)"), vec!["OK CREATE TABLE"]);
        assert_eq!(
            run(&coordinator, "\\prepare ins INSERT INTO t VALUES (?1, ?2)"),
            vec!["OK PREPARE ins 2"]
        );
        assert_eq!(run(&coordinator, "\\execute ins 1 'a|b'"), vec!["OK INSERT 0 1"]);
        assert_eq!(
            run(&coordinator, "SELECT id, name FROM t"),
            vec!["COLUMNS id:int8,name:text", "ROW 1|a\\|b", "OK SELECT 1"]
        );
        assert_eq!(run(&coordinator, "\\close ins"), vec!["OK CLOSE"]);
        assert_eq!(
            run(&coordinator, "\\execute ins 2 'c'"),
            vec!["ERROR 26000 prepared statement \"ins\" does not exist"]
        );
    }

    #[test]
    fn dispatch_reports_errors() {
        let (_dir, coordinator) = coordinator();
        assert_eq!(run(&coordinator, "COMMIT")[0], "ERROR 25P01 there is no transaction in progress");
        assert!(run(&coordinator, "SELECT * FROM missing")[0].starts_with("ERROR 42P01 "));
        assert!(run(&coordinator, "AUTH a b")[0].starts_with("ERROR 42601 "));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials::new("alice", "hunter2");
        assert!(!format!("{credentials:?}").contains("hunter2"));
        assert!(credentials.accepts("alice", "hunter2"));
        assert!(!credentials.accepts("alice", "wrong"));
    }
}
