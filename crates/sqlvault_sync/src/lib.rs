//! # sqlvault sync
//!
//! Keeps a local SQLite working copy and its remote snapshot in step.
//!
//! This crate provides:
//! - [`CacheFile`]: hydrates the working copy from a blob store at startup
//!   and writes it back on request
//! - [`SyncEngine`]: a background task that uploads after commits, on a
//!   fallback timer, and once more at shutdown
//! - [`SyncTrigger`]: the coordinator-facing dirty signal
//!
//! ## Guarantees
//!
//! - Rapid commits coalesce; the state at or after the latest commit is
//!   eventually uploaded, not every intermediate state
//! - A failed upload leaves the change pending for the next event
//! - Remote writes are last-writer-wins; there is no cross-instance
//!   version check
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sqlvault_storage::LocalBlobStore;
//! use sqlvault_sync::{CacheFile, SyncConfig, SyncEngine};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(LocalBlobStore::open("./data")?);
//! let cache = Arc::new(CacheFile::new(store, "myapp", "/tmp", Duration::from_secs(300))?);
//! cache.download(Duration::from_secs(30)).await?;
//!
//! let sync = SyncEngine::start(Arc::clone(&cache), SyncConfig::default(), None);
//! // hand sync.trigger() to the transaction coordinator ...
//! sync.shutdown(Duration::from_secs(30)).await?;
//! cache.cleanup()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod engine;
mod error;

pub use cache::CacheFile;
pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncStats, SyncTrigger};
pub use error::{SyncError, SyncResult};
