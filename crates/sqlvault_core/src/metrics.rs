//! Transaction metrics.
//!
//! The coordinator reports every transaction start and end here. Counters
//! are process-wide; per-connection contexts track the transactions that
//! are currently open so long-idle ones can be found.
//!
//! # Usage
//!
//! ```rust
//! use sqlvault_core::MetricsCollector;
//!
//! let metrics = MetricsCollector::new();
//! metrics.start_transaction("alice@127.0.0.1:5000");
//! metrics.record_query("alice@127.0.0.1:5000");
//! metrics.end_transaction("alice@127.0.0.1:5000", true);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.committed, 1);
//! assert_eq!(snapshot.active, 0);
//! ```

use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::time::{Duration, Instant};

fn as_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Process-wide transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionMetrics {
    /// Transactions started.
    pub total: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions rolled back, explicitly or by disconnect.
    pub rolled_back: u64,
    /// Transactions currently open.
    pub active: u64,
    /// Running mean duration of finished transactions.
    #[serde(rename = "average_duration_ms", serialize_with = "as_millis")]
    pub average_duration: Duration,
    /// Longest finished transaction.
    #[serde(rename = "longest_duration_ms", serialize_with = "as_millis")]
    pub longest_duration: Duration,
}

/// An open transaction as seen by the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    /// Connection that owns the transaction.
    pub connection_id: String,
    /// When BEGIN succeeded.
    pub started_at: Instant,
    /// When the last statement ran.
    pub last_query_at: Instant,
    /// Statements run inside the transaction.
    pub query_count: u64,
}

#[derive(Debug, Default)]
struct MetricsState {
    open: HashMap<String, TransactionContext>,
    totals: TransactionMetrics,
}

/// Aggregates transaction lifecycle events.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    state: RwLock<MetricsState>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful BEGIN.
    pub fn start_transaction(&self, connection_id: &str) {
        let now = Instant::now();
        let mut state = self.state.write();
        let context = TransactionContext {
            connection_id: connection_id.to_string(),
            started_at: now,
            last_query_at: now,
            query_count: 0,
        };
        if state.open.insert(connection_id.to_string(), context).is_none() {
            state.totals.active += 1;
        }
        state.totals.total += 1;
    }

    /// Records the end of a transaction. Unknown connections are ignored.
    pub fn end_transaction(&self, connection_id: &str, committed: bool) {
        let mut state = self.state.write();
        let Some(context) = state.open.remove(connection_id) else {
            return;
        };
        let duration = context.started_at.elapsed();
        let totals = &mut state.totals;

        if committed {
            totals.committed += 1;
        } else {
            totals.rolled_back += 1;
        }
        totals.active = totals.active.saturating_sub(1);

        let finished = u128::from(totals.committed + totals.rolled_back);
        let sum = totals.average_duration.as_nanos() * (finished - 1) + duration.as_nanos();
        totals.average_duration =
            Duration::from_nanos(u64::try_from(sum / finished).unwrap_or(u64::MAX));
        if duration > totals.longest_duration {
            totals.longest_duration = duration;
        }
    }

    /// Records a statement on a connection with an open transaction.
    pub fn record_query(&self, connection_id: &str) {
        let mut state = self.state.write();
        if let Some(context) = state.open.get_mut(connection_id) {
            context.last_query_at = Instant::now();
            context.query_count += 1;
        }
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> TransactionMetrics {
        self.state.read().totals
    }

    /// Returns the open transactions, oldest first.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<TransactionContext> {
        let mut open: Vec<_> = self.state.read().open.values().cloned().collect();
        open.sort_by_key(|c| c.started_at);
        open
    }

    /// Returns connections whose open transaction has been idle longer than `max_idle`.
    #[must_use]
    pub fn stale_transactions(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut stale: Vec<String> = self
            .state
            .read()
            .open
            .values()
            .filter(|c| now.duration_since(c.last_query_at) > max_idle)
            .map(|c| c.connection_id.clone())
            .collect();
        stale.sort();
        stale
    }
}
