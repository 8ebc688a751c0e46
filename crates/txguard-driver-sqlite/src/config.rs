//! SQLite driver configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`SqliteDriver`](crate::SqliteDriver)
///
/// Controls where the database lives and how many transactions may be open
/// at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteDriverConfig {
    /// Database file path, `file:` URI, or `:memory:`
    path: String,
    /// Maximum number of concurrently open transactions (one connection each)
    max_connections: usize,
    /// SQLite busy timeout in milliseconds
    busy_timeout_ms: u64,
    /// Timeout in milliseconds when waiting for a free connection
    acquire_timeout_ms: u64,
}

impl SqliteDriverConfig {
    /// Create a configuration for the database at `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            max_connections: 16,
            busy_timeout_ms: 5_000,
            acquire_timeout_ms: 30_000,
        }
    }

    /// Set the maximum number of concurrently open transactions
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set the busy timeout in milliseconds
    pub fn with_busy_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.busy_timeout_ms = timeout_ms;
        self
    }

    /// Set the acquire timeout in milliseconds
    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Get the database path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the maximum number of connections
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Get the busy timeout as a Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Get the acquire timeout as a Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for SqliteDriverConfig {
    fn default() -> Self {
        Self::new(":memory:")
    }
}
