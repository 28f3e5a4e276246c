//! Blob store selection.

use crate::config::{Backend, StorageSection};
use sqlvault_storage::{
    AzureBlobStore, BlobStore, InMemoryBlobStore, LocalBlobStore, S3BlobStore, StorageResult,
};
use std::sync::Arc;
use tracing::info;

/// Builds the configured blob store.
///
/// # Errors
///
/// Returns the backend's configuration or connection error.
pub async fn open_store(section: &StorageSection) -> StorageResult<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match section.backend {
        Backend::Local => Arc::new(LocalBlobStore::open(&section.local.base_path)?),
        Backend::Memory => Arc::new(InMemoryBlobStore::new()),
        Backend::S3 => Arc::new(S3BlobStore::connect(&section.s3).await?),
        Backend::Azure => Arc::new(AzureBlobStore::connect(&section.azure)?),
    };
    info!(backend = store.backend_name(), "blob store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalSection;
    use sqlvault_storage::AzureConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn selects_local_and_memory() {
        let dir = tempdir().unwrap();
        let section = StorageSection {
            backend: Backend::Local,
            local: LocalSection {
                base_path: dir.path().join("blobs"),
            },
            ..StorageSection::default()
        };
        assert_eq!(open_store(&section).await.unwrap().backend_name(), "local");
        assert!(dir.path().join("blobs").is_dir());

        let section = StorageSection {
            backend: Backend::Memory,
            ..StorageSection::default()
        };
        assert_eq!(open_store(&section).await.unwrap().backend_name(), "memory");
    }

    #[tokio::test]
    async fn azure_without_credentials_is_rejected() {
        let section = StorageSection {
            backend: Backend::Azure,
            azure: AzureConfig::new("acct", "dbs"),
            ..StorageSection::default()
        };
        assert!(open_store(&section).await.is_err());
    }
}
