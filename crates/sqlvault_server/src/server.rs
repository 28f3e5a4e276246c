//! Startup and shutdown sequencing.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::frontend::{Credentials, Frontend};
use crate::storage::open_store;
use sqlvault_core::{
    ConnectionRegistry, Engine, MetricsCollector, SqliteEngine, TransactionCoordinator,
    TransactionMetrics,
};
use sqlvault_storage::BlobStore;
use sqlvault_sync::{CacheFile, SyncEngine};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// What happened during shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Whether the final upload reached the blob store.
    pub flushed: bool,
    /// Transaction counters at exit.
    pub metrics: TransactionMetrics,
}

/// A running sqlvault instance.
///
/// Startup order: blob store, working copy hydration, engine, sync worker,
/// coordinator, listener. Any failure before the listener is bound aborts
/// startup.
pub struct Server {
    config: ServerConfig,
    cache: Arc<CacheFile>,
    engine: Arc<SqliteEngine>,
    coordinator: Arc<TransactionCoordinator>,
    sync: SyncEngine,
    frontend: Frontend,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("cache", &self.cache)
            .field("frontend", &self.frontend)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Builds the configured blob store and starts.
    ///
    /// # Errors
    ///
    /// Returns the first startup failure.
    pub async fn start(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let store = open_store(&config.storage).await?;
        Self::start_with_store(config, store).await
    }

    /// Starts against an already constructed blob store.
    ///
    /// # Errors
    ///
    /// Returns the first startup failure.
    pub async fn start_with_store(
        config: ServerConfig,
        store: Arc<dyn BlobStore>,
    ) -> ServerResult<Self> {
        let cache = Arc::new(CacheFile::new(
            store,
            config.database.name.clone(),
            config.cache_dir(),
            config.sync_interval(),
        )?);
        cache
            .download(Duration::from_secs(config.sync.upload_timeout_secs))
            .await?;

        let path = cache.local_path().to_path_buf();
        let engine_config = config.engine_config();
        let engine = tokio::task::spawn_blocking(move || SqliteEngine::open(path, engine_config))
            .await
            .map_err(|e| ServerError::Task(e.to_string()))??;
        let engine = Arc::new(engine);

        let source: Arc<dyn Engine> = engine.clone();
        let sync = SyncEngine::start(Arc::clone(&cache), config.sync_config(), Some(source));
        let coordinator = Arc::new(
            TransactionCoordinator::new(
                engine.clone(),
                Arc::new(ConnectionRegistry::new()),
                Arc::new(MetricsCollector::new()),
            )
            .with_dirty_signal(Arc::new(sync.trigger()))
            .with_default_mode(config.database.transaction_mode),
        );

        let credentials = Credentials::new(&config.server.user, &config.server.password);
        let frontend =
            Frontend::bind(&config.listen_addr(), Arc::clone(&coordinator), credentials).await?;
        info!(
            addr = ?frontend.local_addr().ok(),
            database = %config.database.name,
            working_copy = %cache.local_path().display(),
            "sqlvault ready"
        );

        Ok(Self {
            config,
            cache,
            engine,
            coordinator,
            sync,
            frontend,
        })
    }

    /// Returns the listener address.
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.frontend.local_addr()
    }

    /// Returns the coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// Returns the working copy path.
    #[must_use]
    pub fn working_copy(&self) -> &Path {
        self.cache.local_path()
    }

    /// Serves until `shutdown` resolves, then stops in order: listener and
    /// sessions, open transactions, final upload, engine, working copy.
    ///
    /// A failed final upload is logged and reported, never returned as an
    /// error; the working copy is then left on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Task`] if a shutdown task panicked.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ServerResult<ShutdownReport> {
        let Self {
            config,
            cache,
            engine,
            coordinator,
            sync,
            frontend,
        } = self;
        let deadline = config.shutdown_timeout();

        let (stop_tx, stop_rx) = watch::channel(false);
        let serving = tokio::spawn(frontend.serve(stop_rx, deadline));

        shutdown.await;
        info!("shutdown requested");
        let _ = stop_tx.send(true);
        serving
            .await
            .map_err(|e| ServerError::Task(e.to_string()))?;

        let evicting = Arc::clone(&coordinator);
        tokio::task::spawn_blocking(move || evicting.shutdown())
            .await
            .map_err(|e| ServerError::Task(e.to_string()))?;

        let flushed = match sync.shutdown(deadline).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "final upload failed; latest commits may not be durable");
                false
            }
        };

        if let Err(e) = engine.close() {
            warn!(error = %e, "engine close failed");
        }
        if flushed {
            if let Err(e) = cache.cleanup() {
                warn!(error = %e, "working copy cleanup failed");
            }
        } else {
            warn!(path = %cache.local_path().display(), "keeping working copy for recovery");
        }

        let metrics = coordinator.metrics().snapshot();
        info!(
            metrics = %serde_json::to_string(&metrics).unwrap_or_default(),
            "final transaction metrics"
        );
        Ok(ShutdownReport { flushed, metrics })
    }
}
