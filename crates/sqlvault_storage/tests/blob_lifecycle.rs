//! Lifecycle tests shared by the local and in-memory blob stores.

use bytes::Bytes;
use sqlvault_storage::{
    with_deadline, BlobStore, InMemoryBlobStore, LocalBlobStore, StorageError,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

async fn exercise(store: Arc<dyn BlobStore>) {
    assert!(store.list().await.unwrap().is_empty());
    assert!(store.download("myapp").await.unwrap().is_none());

    store
        .upload("myapp", Bytes::from_static(b"SQLite format 3\0v1"))
        .await
        .unwrap();
    store
        .upload("audit", Bytes::from_static(b"SQLite format 3\0a"))
        .await
        .unwrap();
    assert!(store.exists("myapp").await.unwrap());
    assert_eq!(store.list().await.unwrap(), vec!["audit", "myapp"]);

    store
        .upload("myapp", Bytes::from_static(b"SQLite format 3\0v2"))
        .await
        .unwrap();
    let data = store.download("myapp").await.unwrap().unwrap();
    assert_eq!(&data[..], b"SQLite format 3\0v2");

    store.delete("audit").await.unwrap();
    store.delete("audit").await.unwrap();
    assert!(!store.exists("audit").await.unwrap());
    assert_eq!(store.list().await.unwrap(), vec!["myapp"]);

    assert!(matches!(
        store.exists("a/b").await,
        Err(StorageError::InvalidName(_))
    ));
}

#[tokio::test]
async fn local_store_lifecycle() {
    let dir = tempdir().unwrap();
    let store = LocalBlobStore::open(dir.path()).unwrap();
    exercise(Arc::new(store)).await;
}

#[tokio::test]
async fn memory_store_lifecycle() {
    exercise(Arc::new(InMemoryBlobStore::new())).await;
}

#[tokio::test]
async fn local_store_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = LocalBlobStore::open(dir.path()).unwrap();
        store.upload("kept", Bytes::from_static(b"x")).await.unwrap();
    }
    let store = LocalBlobStore::open(dir.path()).unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["kept"]);
}

#[tokio::test]
async fn deadline_wraps_store_calls() {
    let store = InMemoryBlobStore::new();
    with_deadline(
        Duration::from_secs(5),
        store.upload("db", Bytes::from_static(b"1")),
    )
    .await
    .unwrap();
    assert_eq!(store.get("db").unwrap(), "1");
}
