//! # sqlvault server
//!
//! Serves a SQLite database whose durable copy lives in object storage.
//!
//! The server hydrates a local working copy from the configured blob store,
//! runs client statements through the transaction coordinator, and uploads
//! the working copy after commits and once more at shutdown.
//!
//! ## Modules
//!
//! - [`config`]: TOML file plus environment overrides
//! - [`protocol`]: the line protocol clients speak
//! - [`frontend`]: TCP listener and per-client sessions
//! - [`Server`]: startup and shutdown sequencing

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod error;
pub mod frontend;
pub mod protocol;
mod server;
mod storage;

pub use config::{ConfigError, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use server::{Server, ShutdownReport};
pub use storage::open_store;
