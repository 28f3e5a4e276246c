//! The local working copy of one logical database.

use crate::error::SyncResult;
use bytes::Bytes;
use parking_lot::Mutex;
use sqlvault_storage::{validate_name, with_deadline, BlobStore, DB_SUFFIX};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// One logical database materialized as a local file.
///
/// The local path is `<dir>/<name>-<unix millis><suffix>`, unique per
/// instantiation, so a file still held open by a previous process is never
/// reused.
pub struct CacheFile {
    store: Arc<dyn BlobStore>,
    name: String,
    local_path: PathBuf,
    sync_interval: Duration,
    last_sync: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFile")
            .field("backend", &self.store.backend_name())
            .field("name", &self.name)
            .field("local_path", &self.local_path)
            .field("sync_interval", &self.sync_interval)
            .finish_non_exhaustive()
    }
}

impl CacheFile {
    /// Creates a cache for `name` whose working copy lives in `dir`.
    ///
    /// Nothing is read or written until [`Self::download`].
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid logical database name.
    pub fn new(
        store: Arc<dyn BlobStore>,
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        sync_interval: Duration,
    ) -> SyncResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let local_path = dir.as_ref().join(format!("{name}-{millis}{DB_SUFFIX}"));
        Ok(Self {
            store,
            name,
            local_path,
            sync_interval,
            last_sync: Mutex::new(None),
        })
    }

    /// Returns the logical database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path the engine should open.
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Returns where engine snapshots are staged before upload.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.sibling("-snapshot")
    }

    /// Returns when the working copy last matched the remote blob.
    #[must_use]
    pub fn last_sync(&self) -> Option<Instant> {
        *self.last_sync.lock()
    }

    /// Returns true once the sync interval has elapsed since the last sync.
    #[must_use]
    pub fn should_sync(&self) -> bool {
        self.last_sync()
            .map_or(true, |at| at.elapsed() >= self.sync_interval)
    }

    /// Materializes the remote blob as a new local file.
    ///
    /// A missing blob yields an empty file, which SQLite treats as a new
    /// database. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails or exceeds `deadline`, or if
    /// the local file cannot be created. An existing file at the local path
    /// is an error.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn download(&self, deadline: Duration) -> SyncResult<u64> {
        let blob = with_deadline(deadline, self.store.download(&self.name)).await?;
        let existed = blob.is_some();
        let data = blob.unwrap_or_else(Bytes::new);

        if let Some(parent) = self.local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.local_path)
            .await?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        *self.last_sync.lock() = Some(Instant::now());
        info!(
            path = %self.local_path.display(),
            bytes = data.len(),
            existed,
            "working copy hydrated"
        );
        Ok(data.len() as u64)
    }

    /// Uploads the current local file, replacing the remote blob.
    ///
    /// The file is read as is. Use [`Self::upload_from`] with an engine
    /// snapshot while the database is open. Returns the number of bytes
    /// uploaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the local file cannot be read or the upload fails
    /// or exceeds `deadline`.
    pub async fn upload(&self, deadline: Duration) -> SyncResult<u64> {
        self.upload_from(&self.local_path, deadline).await
    }

    /// Uploads `path` under this cache's name, replacing the remote blob.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be read or the upload fails or
    /// exceeds `deadline`.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn upload_from(&self, path: &Path, deadline: Duration) -> SyncResult<u64> {
        let data = Bytes::from(fs::read(path).await?);
        let len = data.len() as u64;
        with_deadline(deadline, self.store.upload(&self.name, data)).await?;
        *self.last_sync.lock() = Some(Instant::now());
        debug!(bytes = len, source = %path.display(), "working copy uploaded");
        Ok(len)
    }

    /// Removes the local file, its `-wal` and `-shm` siblings and any staged
    /// snapshot.
    ///
    /// Missing files are ignored.
    ///
    /// # Errors
    ///
    /// Returns the first removal error other than not-found.
    pub fn cleanup(&self) -> SyncResult<()> {
        let mut first_error = None;
        for path in self.local_files() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not remove cache file");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.local_path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn local_files(&self) -> [PathBuf; 4] {
        [
            self.local_path.clone(),
            self.sibling("-wal"),
            self.sibling("-shm"),
            self.snapshot_path(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlvault_storage::InMemoryBlobStore;
    use tempfile::tempdir;

    const DEADLINE: Duration = Duration::from_secs(5);

    #[test]
    fn local_path_is_unique_per_name() {
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = CacheFile::new(store, "appdb", "/var/cache", Duration::from_secs(60)).unwrap();
        let file = cache.local_path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(file.starts_with("appdb-"), "{file}");
        assert!(file.ends_with(".sqlite"), "{file}");
    }

    #[test]
    fn rejects_bad_names() {
        let store = Arc::new(InMemoryBlobStore::new());
        assert!(CacheFile::new(store, "../etc", "/tmp", Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn bootstrap_creates_empty_file() {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = CacheFile::new(store, "appdb", dir.path(), Duration::from_secs(60)).unwrap();

        assert!(cache.should_sync());
        assert_eq!(cache.download(DEADLINE).await.unwrap(), 0);
        assert_eq!(std::fs::metadata(cache.local_path()).unwrap().len(), 0);
        assert!(!cache.should_sync());
    }

    #[tokio::test]
    async fn download_then_upload() {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::with_blob(
            "appdb",
            Bytes::from_static(b"snapshot"),
        ));
        let cache =
            CacheFile::new(store.clone(), "appdb", dir.path(), Duration::from_secs(60)).unwrap();

        assert_eq!(cache.download(DEADLINE).await.unwrap(), 8);
        assert_eq!(std::fs::read(cache.local_path()).unwrap(), b"snapshot");

        std::fs::write(cache.local_path(), b"changed").unwrap();
        assert_eq!(cache.upload(DEADLINE).await.unwrap(), 7);
        assert_eq!(store.get("appdb").unwrap(), Bytes::from_static(b"changed"));
    }

    #[tokio::test]
    async fn download_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = CacheFile::new(store, "appdb", dir.path(), Duration::from_secs(60)).unwrap();
        cache.download(DEADLINE).await.unwrap();
        assert!(cache.download(DEADLINE).await.is_err());
    }

    #[tokio::test]
    async fn zero_interval_always_syncs() {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = CacheFile::new(store, "appdb", dir.path(), Duration::ZERO).unwrap();
        cache.download(DEADLINE).await.unwrap();
        assert!(cache.should_sync());
    }

    #[tokio::test]
    async fn cleanup_removes_siblings() {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = CacheFile::new(store, "appdb", dir.path(), Duration::from_secs(60)).unwrap();
        cache.download(DEADLINE).await.unwrap();
        let wal = dir
            .path()
            .join(format!("{}-wal", cache.local_path().file_name().unwrap().to_string_lossy()));
        std::fs::write(&wal, b"frames").unwrap();
        std::fs::write(cache.snapshot_path(), b"copy").unwrap();

        cache.cleanup().unwrap();
        assert!(!cache.local_path().exists());
        assert!(!wal.exists());
        assert!(!cache.snapshot_path().exists());
        cache.cleanup().unwrap();
    }
}
