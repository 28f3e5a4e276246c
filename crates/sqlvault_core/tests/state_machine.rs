//! Randomized BEGIN/COMMIT/ROLLBACK sequences checked against a model.

use proptest::prelude::*;
use sqlvault_core::{
    ConnectionRegistry, CoreError, Engine, EngineError, EngineResult, EngineTransaction,
    MetricsCollector, QueryResult, StatementInfo, TransactionCoordinator, TransactionMode,
    TransactionStatus, Value,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct FaultyEngine {
    fail_commit: Arc<AtomicBool>,
}

struct FaultyTransaction {
    fail_commit: Arc<AtomicBool>,
    mode: TransactionMode,
}

fn busy() -> EngineError {
    EngineError::Sqlite(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    ))
}

impl Engine for FaultyEngine {
    fn begin(&self, mode: TransactionMode) -> EngineResult<Box<dyn EngineTransaction>> {
        Ok(Box::new(FaultyTransaction {
            fail_commit: Arc::clone(&self.fail_commit),
            mode,
        }))
    }
    fn exec(&self, _: &str, _: &[Value]) -> EngineResult<u64> {
        Ok(0)
    }
    fn query(&self, _: &str, _: &[Value]) -> EngineResult<QueryResult> {
        Ok(QueryResult::default())
    }
    fn prepare(&self, _: &str) -> EngineResult<StatementInfo> {
        Ok(StatementInfo::default())
    }
    fn snapshot(&self, _: &Path) -> EngineResult<u64> {
        Ok(0)
    }
    fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

impl EngineTransaction for FaultyTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }
    fn exec(&mut self, _: &str, _: &[Value]) -> EngineResult<u64> {
        Ok(1)
    }
    fn query(&mut self, _: &str, _: &[Value]) -> EngineResult<QueryResult> {
        Ok(QueryResult::default())
    }
    fn prepare(&mut self, _: &str) -> EngineResult<StatementInfo> {
        Ok(StatementInfo::default())
    }
    fn commit(&mut self) -> EngineResult<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            Err(busy())
        } else {
            Ok(())
        }
    }
    fn rollback(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Begin,
    Commit,
    FailingCommit,
    Rollback,
    Write,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Begin),
        Just(Op::Commit),
        Just(Op::FailingCommit),
        Just(Op::Rollback),
        Just(Op::Write),
    ]
}

proptest! {
    #[test]
    fn coordinator_follows_model(ops in prop::collection::vec(op(), 1..40)) {
        let engine = FaultyEngine::default();
        let fail_commit = Arc::clone(&engine.fail_commit);
        let coordinator = TransactionCoordinator::new(
            Arc::new(engine),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(MetricsCollector::new()),
        );

        let mut model = TransactionStatus::Idle;
        let (mut committed, mut rolled_back) = (0u64, 0u64);

        for op in ops {
            fail_commit.store(matches!(op, Op::FailingCommit), Ordering::SeqCst);
            let result = match op {
                Op::Begin => coordinator.execute("c", "BEGIN"),
                Op::Commit | Op::FailingCommit => coordinator.execute("c", "COMMIT"),
                Op::Rollback => coordinator.execute("c", "ROLLBACK"),
                Op::Write => coordinator.execute("c", "UPDATE t SET x = 1"),
            };

            match (op, model) {
                (Op::Begin, TransactionStatus::Idle) => {
                    prop_assert!(result.is_ok());
                    model = TransactionStatus::Active;
                }
                (Op::Begin, _) => {
                    prop_assert!(matches!(result, Err(CoreError::AlreadyInTransaction)));
                }
                (Op::Commit | Op::FailingCommit | Op::Rollback, TransactionStatus::Idle) => {
                    prop_assert!(matches!(result, Err(CoreError::NoActiveTransaction)));
                }
                (Op::Commit | Op::FailingCommit, TransactionStatus::Failed) => {
                    prop_assert_eq!(result.map_err(|e| e.sqlstate()).err(), Some("40001"));
                }
                (Op::Commit, TransactionStatus::Active) => {
                    prop_assert!(result.is_ok());
                    committed += 1;
                    model = TransactionStatus::Idle;
                }
                (Op::FailingCommit, TransactionStatus::Active) => {
                    prop_assert_eq!(result.map_err(|e| e.sqlstate()).err(), Some("40001"));
                    model = TransactionStatus::Failed;
                }
                (Op::Rollback, _) => {
                    prop_assert!(result.is_ok());
                    rolled_back += 1;
                    model = TransactionStatus::Idle;
                }
                (Op::Write, TransactionStatus::Failed) => {
                    prop_assert!(matches!(result, Err(CoreError::TransactionFailed)));
                }
                (Op::Write, _) => {
                    prop_assert!(result.is_ok());
                }
            }

            prop_assert_eq!(coordinator.status("c"), model);
            let metrics = coordinator.metrics().snapshot();
            prop_assert_eq!(metrics.committed, committed);
            prop_assert_eq!(metrics.rolled_back, rolled_back);
            prop_assert_eq!(metrics.active, u64::from(model != TransactionStatus::Idle));
        }
    }
}
