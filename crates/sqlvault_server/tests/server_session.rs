//! End-to-end sessions against a server backed by an in-memory blob store.

use sqlvault_server::{Server, ServerConfig, ShutdownReport};
use sqlvault_storage::InMemoryBlobStore;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn config(cache_dir: &Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.database.cache_dir = Some(cache_dir.to_path_buf());
    config.database.busy_timeout_ms = 200;
    config.sync.shutdown_timeout_secs = 5;
    config
}

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<sqlvault_server::ServerResult<ShutdownReport>>,
}

impl Running {
    async fn start(store: Arc<InMemoryBlobStore>, cache_dir: &Path) -> Self {
        let server = Server::start_with_store(config(cache_dir), store).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));
        Self { addr, stop, handle }
    }

    async fn stop(self) -> ShutdownReport {
        self.stop.send(()).unwrap();
        self.handle.await.unwrap().unwrap()
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Sends one line and collects the reply up to its OK or ERROR line.
    async fn send(&mut self, line: &str) -> Vec<String> {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let mut reply = Vec::new();
        while let Some(line) = self.lines.next_line().await.unwrap() {
            let done = line.starts_with("OK") || line.starts_with("ERROR");
            reply.push(line);
            if done {
                break;
            }
        }
        reply
    }

    async fn login(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        assert_eq!(client.send("AUTH postgres postgres").await, vec!["OK AUTH"]);
        client
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_password_is_rejected() {
    let dir = tempdir().unwrap();
    let store = Arc::new(InMemoryBlobStore::new());
    let server = Running::start(store, dir.path()).await;

    let mut client = Client::connect(server.addr).await;
    let reply = client.send("AUTH postgres nope").await;
    assert_eq!(reply.len(), 1);
    assert!(reply[0].starts_with("ERROR 28P01 "), "{reply:?}");
    assert!(client.lines.next_line().await.unwrap().is_none());

    let mut client = Client::connect(server.addr).await;
    let reply = client.send("SELECT 1").await;
    assert!(reply[0].starts_with("ERROR 28P01 "), "{reply:?}");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn committed_data_is_flushed_and_rehydrated() {
    let store = Arc::new(InMemoryBlobStore::new());

    let first_dir = tempdir().unwrap();
    let server = Running::start(Arc::clone(&store), first_dir.path()).await;
    let mut client = Client::login(server.addr).await;
    assert_eq!(
        client.send("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)").await,
        vec!["OK CREATE TABLE"]
    );
    assert_eq!(client.send("BEGIN").await, vec!["OK BEGIN"]);
    assert_eq!(
        client.send("INSERT INTO notes (body) VALUES ('kept')").await,
        vec!["OK INSERT 0 1"]
    );
    assert_eq!(client.send("COMMIT").await, vec!["OK COMMIT"]);
    assert_eq!(client.send("BEGIN").await, vec!["OK BEGIN"]);
    assert_eq!(
        client.send("INSERT INTO notes (body) VALUES ('dropped')").await,
        vec!["OK INSERT 0 1"]
    );
    assert_eq!(client.send("ROLLBACK").await, vec!["OK ROLLBACK"]);
    assert_eq!(client.send("\\quit").await, vec!["OK BYE"]);

    let report = server.stop().await;
    assert!(report.flushed);
    assert_eq!(report.metrics.committed, 1);
    assert_eq!(report.metrics.rolled_back, 1);
    assert!(!store.get("myapp").unwrap().is_empty());
    assert_eq!(std::fs::read_dir(first_dir.path()).unwrap().count(), 0);

    let second_dir = tempdir().unwrap();
    let server = Running::start(Arc::clone(&store), second_dir.path()).await;
    let mut client = Client::login(server.addr).await;
    assert_eq!(
        client.send("SELECT body FROM notes").await,
        vec!["COLUMNS body:text", "ROW kept", "OK SELECT 1"]
    );
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_client_rolls_back() {
    let dir = tempdir().unwrap();
    let store = Arc::new(InMemoryBlobStore::new());
    let server = Running::start(store, dir.path()).await;

    let mut setup = Client::login(server.addr).await;
    setup.send("CREATE TABLE t (v INTEGER)").await;

    let mut client = Client::login(server.addr).await;
    assert_eq!(client.send("BEGIN").await, vec!["OK BEGIN"]);
    assert_eq!(client.send("INSERT INTO t VALUES (1)").await, vec!["OK INSERT 0 1"]);
    drop(client);

    // The abandoned transaction holds the write lock until the server
    // notices the disconnect and rolls it back.
    let mut written = false;
    for _ in 0..50 {
        if setup.send("INSERT INTO t VALUES (2)").await == vec!["OK INSERT 0 1"] {
            written = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(written);
    assert_eq!(
        setup.send("SELECT v FROM t").await,
        vec!["COLUMNS v:int8", "ROW 2", "OK SELECT 1"]
    );

    let report = server.stop().await;
    assert_eq!(report.metrics.rolled_back, 1);
    assert_eq!(report.metrics.active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_ends_open_sessions() {
    let dir = tempdir().unwrap();
    let store = Arc::new(InMemoryBlobStore::new());
    let server = Running::start(Arc::clone(&store), dir.path()).await;

    let mut client = Client::login(server.addr).await;
    assert_eq!(client.send("BEGIN").await, vec!["OK BEGIN"]);
    let report = server.stop().await;
    assert!(report.flushed);
    assert_eq!(report.metrics.rolled_back, 1);

    let notice = client.lines.next_line().await.unwrap().unwrap();
    assert!(notice.starts_with("ERROR 57P01 "), "{notice}");
    assert!(client.lines.next_line().await.unwrap().is_none());
}
