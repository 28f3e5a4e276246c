//! # sqlvault core
//!
//! Transaction coordination over an embedded SQLite working copy.
//!
//! This crate provides:
//! - The engine contract ([`Engine`], [`EngineTransaction`]) and its SQLite
//!   implementation backed by a bounded connection pool
//! - A [`ConnectionRegistry`] holding per-connection transaction state
//! - The [`TransactionCoordinator`] that drives the Idle/Active/Failed state
//!   machine and routes statements to the engine
//! - Error translation from engine messages to PostgreSQL SQLSTATE classes
//! - Transaction metrics for reporting
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sqlvault_core::{
//!     ConnectionRegistry, EngineConfig, MetricsCollector, Outcome, SqliteEngine,
//!     TransactionCoordinator,
//! };
//!
//! let engine = SqliteEngine::open("app.sqlite", EngineConfig::default()).unwrap();
//! let coordinator = TransactionCoordinator::new(
//!     Arc::new(engine),
//!     Arc::new(ConnectionRegistry::new()),
//!     Arc::new(MetricsCollector::new()),
//! );
//!
//! coordinator.execute("alice@local", "CREATE TABLE t (id INTEGER)").unwrap();
//! coordinator.execute("alice@local", "BEGIN IMMEDIATE").unwrap();
//! coordinator.execute("alice@local", "INSERT INTO t VALUES (1)").unwrap();
//! coordinator.execute("alice@local", "COMMIT").unwrap();
//!
//! match coordinator.execute("alice@local", "SELECT count(*) FROM t").unwrap() {
//!     Outcome::Rows(rows) => assert_eq!(rows.rows.len(), 1),
//!     other => panic!("unexpected outcome {other:?}"),
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod engine;
mod error;
mod metrics;
mod registry;
mod statement;
mod translate;
mod types;

pub use config::EngineConfig;
pub use coordinator::{DirtySignal, Outcome, TransactionCoordinator};
pub use engine::{Engine, EngineError, EngineResult, EngineTransaction, SqliteEngine, StatementInfo};
pub use error::{CoreError, CoreResult};
pub use metrics::{MetricsCollector, TransactionContext, TransactionMetrics};
pub use registry::{ConnectionHandle, ConnectionRegistry, ConnectionState, PreparedStatement, RemovedConnection};
pub use statement::{Control, DdlKind, Statement, WriteKind};
pub use translate::{translate, ErrorClass, ERROR_PATTERNS};
pub use types::{Column, PgType, QueryResult, TransactionMode, TransactionStatus, Value};
