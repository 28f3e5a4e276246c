//! Blob store trait definition.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

/// Deadline applied to a single transfer when the caller has no better value.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// A store of whole database files addressed by logical name.
///
/// Blob stores are **opaque byte stores**. A logical name `orders` is stored
/// as the blob `<prefix>orders.sqlite`; callers never see the suffix or the
/// prefix.
///
/// # Invariants
///
/// - `download` returns `Ok(None)` when the blob does not exist
/// - `upload` fully replaces the blob; readers never observe a partial write
/// - `list` returns logical names only, never keys outside the prefix
/// - `delete` of a missing blob succeeds
///
/// # Implementors
///
/// - [`crate::LocalBlobStore`] - Files in a local directory
/// - [`crate::InMemoryBlobStore`] - For testing
/// - [`crate::S3BlobStore`] - Amazon S3 compatible services
/// - [`crate::AzureBlobStore`] - Azure Blob Storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetches the complete contents of the named database.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the backend fails. A missing
    /// blob is reported as `Ok(None)`.
    async fn download(&self, name: &str) -> StorageResult<Option<Bytes>>;

    /// Replaces the named database with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the backend fails.
    async fn upload(&self, name: &str, data: Bytes) -> StorageResult<()>;

    /// Lists the logical names of all databases in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn list(&self) -> StorageResult<Vec<String>>;

    /// Removes the named database. Missing blobs are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the backend fails.
    async fn delete(&self, name: &str) -> StorageResult<()>;

    /// Reports whether the named database exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the backend fails.
    async fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Short backend identifier used in logs and errors.
    fn backend_name(&self) -> &'static str;
}

/// Runs a storage future, failing with [`StorageError::DeadlineExceeded`]
/// if it does not complete in time.
///
/// # Errors
///
/// Returns the future's own error, or `DeadlineExceeded` on timeout.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::DeadlineExceeded(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_passes_through_result() {
        let value = with_deadline(Duration::from_secs(1), async { Ok(7u32) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn deadline_expires() {
        let result: StorageResult<()> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StorageError::DeadlineExceeded(_))));
    }
}
