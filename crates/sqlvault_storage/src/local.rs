//! Blob store backed by a local directory.

use crate::backend::BlobStore;
use crate::error::StorageResult;
use crate::key::{logical_name, object_key, validate_name};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

/// A blob store that keeps each database as `<base>/<name>.sqlite`.
///
/// # Durability
///
/// Uploads are written to a uniquely named temporary file in the same
/// directory, synced with `sync_all`, then renamed over the destination.
/// A failed or cancelled upload leaves the previous blob intact and removes
/// its temporary file.
///
/// # Example
///
/// ```no_run
/// use sqlvault_storage::LocalBlobStore;
///
/// let store = LocalBlobStore::open("./data").unwrap();
/// assert_eq!(store.base_path().to_str(), Some("./data"));
/// ```
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    /// Opens a store rooted at `base_path`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(base_path: impl AsRef<Path>) -> StorageResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Returns the directory that holds the blobs.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, name: &str) -> StorageResult<PathBuf> {
        validate_name(name)?;
        Ok(self.base_path.join(object_key("", name)))
    }
}

/// Removes a temporary file unless the write it belongs to completed.
struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn download(&self, name: &str) -> StorageResult<Option<Bytes>> {
        let path = self.blob_path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn upload(&self, name: &str, data: Bytes) -> StorageResult<()> {
        let path = self.blob_path(name)?;
        let temp_path = self
            .base_path
            .join(format!(".{name}.tmp.{}", Uuid::new_v4()));

        let mut guard = TempFileGuard::new(temp_path.clone());
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;
        guard.disarm();

        debug!(path = %path.display(), "blob written");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(name) = logical_name("", file_name) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, name: &str) -> StorageResult<()> {
        let path = self.blob_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        let path = self.blob_path(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
