//! In-memory blob store for testing.

use crate::backend::BlobStore;
use crate::error::StorageResult;
use crate::key::validate_name;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory blob store.
///
/// All blobs live in a map keyed by logical name. Suitable for unit tests,
/// integration tests and throwaway deployments.
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use sqlvault_storage::{BlobStore, InMemoryBlobStore};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let store = InMemoryBlobStore::with_blob("myapp", Bytes::from_static(b"data"));
/// assert_eq!(store.download("myapp").await.unwrap().unwrap(), "data");
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds one blob.
    #[must_use]
    pub fn with_blob(name: impl Into<String>, data: Bytes) -> Self {
        let store = Self::new();
        store.blobs.write().insert(name.into(), data);
        store
    }

    /// Returns a copy of the named blob without going through the async API.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.blobs.read().get(name).cloned()
    }

    /// Returns the number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Returns true if the store holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn download(&self, name: &str) -> StorageResult<Option<Bytes>> {
        validate_name(name)?;
        Ok(self.get(name))
    }

    async fn upload(&self, name: &str, data: Bytes) -> StorageResult<()> {
        validate_name(name)?;
        self.blobs.write().insert(name.to_string(), data);
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        Ok(self.blobs.read().keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        self.blobs.write().remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> StorageResult<bool> {
        validate_name(name)?;
        Ok(self.blobs.read().contains_key(name))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
