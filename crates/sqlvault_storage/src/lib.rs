//! # sqlvault storage
//!
//! Blob store trait and backends for sqlvault.
//!
//! A blob store persists whole database files as named blobs. Backends are
//! **opaque byte stores**: they never look inside a database file, they only
//! move complete snapshots in and out of a container.
//!
//! ## Design Principles
//!
//! - A logical database name maps to exactly one blob (`<prefix><name>.sqlite`)
//! - `download` of a missing blob is not an error; it yields `None`
//! - Uploads replace the previous blob atomically from the reader's view
//! - Must be `Send + Sync` so one store can be shared across tasks
//!
//! ## Available Backends
//!
//! - [`LocalBlobStore`] - Files in a local directory
//! - [`InMemoryBlobStore`] - For testing and ephemeral storage
//! - [`S3BlobStore`] - Amazon S3 and S3-compatible services
//! - [`AzureBlobStore`] - Azure Blob Storage over its REST API
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use sqlvault_storage::{BlobStore, InMemoryBlobStore};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = InMemoryBlobStore::new();
//! store.upload("orders", Bytes::from_static(b"SQLite format 3\0")).await.unwrap();
//! assert!(store.exists("orders").await.unwrap());
//! assert_eq!(store.list().await.unwrap(), vec!["orders".to_string()]);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod azure;
mod backend;
mod error;
mod key;
mod local;
mod memory;
mod s3;

pub use azure::{AzureBlobStore, AzureConfig};
pub use backend::{with_deadline, BlobStore, DEFAULT_DEADLINE};
pub use error::{StorageError, StorageResult};
pub use key::{logical_name, normalize_prefix, object_key, validate_name, DB_SUFFIX};
pub use local::LocalBlobStore;
pub use memory::InMemoryBlobStore;
pub use s3::{S3BlobStore, S3Config};
