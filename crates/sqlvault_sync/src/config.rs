//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for background uploads.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of the fallback timer. An idle, unchanged working copy is
    /// re-uploaded at most once per interval.
    pub sync_interval: Duration,
    /// Deadline for one background upload.
    pub upload_timeout: Duration,
    /// Deadline for the final upload when the engine stops.
    pub shutdown_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fallback timer period. Zero is raised to one millisecond.
    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Sets the background upload deadline.
    #[must_use]
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Sets the shutdown upload deadline.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5 * 60),
            upload_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}
