//! Background upload worker.
//!
//! ## Scheduling
//!
//! One task reacts to three events, checked in this order:
//!
//! 1. **Stop**: one final upload under the caller's deadline, then exit.
//! 2. **Commit signal**: upload now if anything is pending.
//! 3. **Timer**: upload if something is pending or the cache interval has
//!    elapsed.
//!
//! The commit channel holds one message. Signals that arrive while it is
//! full are dropped; the generation counter still records them, so the
//! queued message uploads their state.

use crate::cache::CacheFile;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use sqlvault_core::{DirtySignal, Engine};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Upload counters.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Uploads that completed.
    pub uploads_completed: u64,
    /// Uploads that failed.
    pub uploads_failed: u64,
    /// Bytes sent by the last successful upload.
    pub last_upload_bytes: u64,
    /// When the last successful upload finished.
    pub last_upload_time: Option<Instant>,
    /// Message of the most recent failure, cleared by the next success.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Generations {
    dirty: u64,
    uploaded: u64,
}

struct Shared {
    cache: Arc<CacheFile>,
    source: Option<Arc<dyn Engine>>,
    config: SyncConfig,
    generations: Mutex<Generations>,
    stats: Mutex<SyncStats>,
    upload_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn is_pending(&self) -> bool {
        let generations = self.generations.lock();
        generations.dirty > generations.uploaded
    }

    async fn upload(&self, deadline: Duration, reason: &'static str) -> SyncResult<u64> {
        let _serial = self.upload_lock.lock().await;
        let observed = self.generations.lock().dirty;

        match self.snapshot(deadline).await {
            Ok(bytes) => {
                {
                    let mut generations = self.generations.lock();
                    generations.uploaded = generations.uploaded.max(observed);
                }
                let mut stats = self.stats.lock();
                stats.uploads_completed += 1;
                stats.last_upload_bytes = bytes;
                stats.last_upload_time = Some(Instant::now());
                stats.last_error = None;
                info!(reason, bytes, generation = observed, "working copy uploaded");
                Ok(bytes)
            }
            Err(err) => {
                let mut stats = self.stats.lock();
                stats.uploads_failed += 1;
                stats.last_error = Some(err.to_string());
                warn!(reason, error = %err, "upload failed; will retry");
                Err(err)
            }
        }
    }

    async fn snapshot(&self, deadline: Duration) -> SyncResult<u64> {
        let Some(engine) = &self.source else {
            return self.cache.upload(deadline).await;
        };

        let engine = Arc::clone(engine);
        let staged = self.cache.snapshot_path();
        let dest = staged.clone();
        tokio::task::spawn_blocking(move || engine.snapshot(&dest))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
            .map_err(|e| SyncError::Snapshot(e.to_string()))?;

        let result = self.cache.upload_from(&staged, deadline).await;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            debug!(path = %staged.display(), error = %e, "could not remove staged snapshot");
        }
        result
    }

    async fn upload_if_pending(&self, reason: &'static str) {
        if !self.is_pending() {
            debug!(reason, "nothing pending");
            return;
        }
        // failures are recorded in stats and retried on the next event
        let _ = self.upload(self.config.upload_timeout, reason).await;
    }
}

/// Marks the working copy dirty and wakes the worker.
///
/// Cheap to clone; hand one to the coordinator as its [`DirtySignal`].
#[derive(Clone)]
pub struct SyncTrigger {
    shared: Arc<Shared>,
    tx: mpsc::Sender<()>,
}

impl std::fmt::Debug for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTrigger")
            .field("pending", &self.shared.is_pending())
            .finish()
    }
}

impl DirtySignal for SyncTrigger {
    fn mark_dirty(&self) {
        self.shared.generations.lock().dirty += 1;
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => {
                debug!("sync worker stopped; change stays pending");
            }
        }
    }
}

/// Owns the background upload task for one [`CacheFile`].
///
/// Dropping the engine without calling [`Self::shutdown`] still asks the
/// worker for a final upload, but nothing waits for it.
pub struct SyncEngine {
    shared: Arc<Shared>,
    trigger: SyncTrigger,
    stop: Option<oneshot::Sender<Duration>>,
    worker: Option<JoinHandle<SyncResult<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("cache", &self.shared.cache)
            .field("pending", &self.shared.is_pending())
            .field("running", &self.stop.is_some())
            .finish()
    }
}

impl SyncEngine {
    /// Spawns the worker on the current Tokio runtime.
    ///
    /// `source`, when given, writes a consistent copy of the open database
    /// for every upload; without it the working copy file is read directly.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(
        cache: Arc<CacheFile>,
        config: SyncConfig,
        source: Option<Arc<dyn Engine>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            cache,
            source,
            config,
            generations: Mutex::new(Generations::default()),
            stats: Mutex::new(SyncStats::default()),
            upload_lock: tokio::sync::Mutex::new(()),
        });
        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(run(Arc::clone(&shared), rx, stop_rx));
        info!(
            name = %shared.cache.name(),
            interval = ?shared.config.sync_interval,
            "sync engine started"
        );

        Self {
            trigger: SyncTrigger {
                shared: Arc::clone(&shared),
                tx,
            },
            shared,
            stop: Some(stop_tx),
            worker: Some(worker),
        }
    }

    /// Returns a handle that marks the working copy dirty.
    #[must_use]
    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    /// Returns true if a commit has not been uploaded yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.is_pending()
    }

    /// Returns a copy of the upload counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.lock().clone()
    }

    /// Uploads now, whether or not anything is pending.
    ///
    /// # Errors
    ///
    /// Returns the snapshot, read or storage error. The pending state is
    /// left untouched on failure.
    pub async fn force_upload(&self, deadline: Duration) -> SyncResult<u64> {
        self.shared.upload(deadline, "forced").await
    }

    /// Stops the worker after one final upload bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// Returns the final upload's error, or [`SyncError::Task`] if the worker
    /// panicked.
    pub async fn shutdown(mut self, deadline: Duration) -> SyncResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(deadline);
        }
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let result = worker
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?;
        info!(pending = self.shared.is_pending(), "sync engine stopped");
        result
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(self.shared.config.shutdown_timeout);
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<()>,
    mut stop: oneshot::Receiver<Duration>,
) -> SyncResult<()> {
    let period = shared.config.sync_interval;
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            deadline = &mut stop => {
                let deadline = deadline.unwrap_or(shared.config.shutdown_timeout);
                return match shared.upload(deadline, "shutdown").await {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        error!(error = %err, "final upload failed");
                        Err(err)
                    }
                };
            }
            Some(()) = rx.recv() => {
                shared.upload_if_pending("commit").await;
            }
            _ = ticker.tick() => {
                if shared.is_pending() || shared.cache.should_sync() {
                    let _ = shared.upload(shared.config.upload_timeout, "timer").await;
                }
            }
        }
    }
}
