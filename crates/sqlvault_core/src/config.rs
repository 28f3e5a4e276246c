//! Engine configuration.

use std::time::Duration;

/// Configuration for opening the SQLite working copy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of open connections.
    pub pool_size: usize,

    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,

    /// How long SQLite retries on a locked database before failing.
    pub busy_timeout: Duration,

    /// Capacity of each connection's prepared statement cache.
    pub statement_cache_capacity: usize,

    /// Whether to enforce foreign key constraints.
    pub foreign_keys: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_millis(5000),
            statement_cache_capacity: 64,
            foreign_keys: true,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pool size. Zero is treated as one.
    #[must_use]
    pub const fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets the pool acquire timeout.
    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the SQLite busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets whether foreign keys are enforced.
    #[must_use]
    pub const fn foreign_keys(mut self, value: bool) -> Self {
        self.foreign_keys = value;
        self
    }

    /// Number of connections kept open while idle.
    #[must_use]
    pub const fn max_idle(&self) -> usize {
        let half = self.pool_size / 2;
        if half == 0 {
            1
        } else {
            half
        }
    }
}
