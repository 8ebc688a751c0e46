//! Executor configuration
//!
//! [`ParallelOptions`] carries every knob of a parallel call. It can be built
//! in code with the `with_*` methods or loaded from the `[executor]` table of a
//! TOML file through [`ExecutorSettings`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use txguard_core::{Result, TxGuardError};

/// How the batch is split across partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Adjacent rows stay together; sizes differ by at most one
    #[default]
    Contiguous,
    /// Row `i` goes to partition `i mod p`
    RoundRobin,
}

/// What a single partition failure does to the rest of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failure cancels every other partition and is raised to the caller
    #[default]
    FailTogether,
    /// Partitions succeed or fail independently; the caller inspects each result
    Isolated,
}

/// Options for one parallel call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOptions {
    /// Maximum number of partitions, and so of concurrently open transactions
    pub parallelism: usize,
    /// Per-transaction deadline in milliseconds (0 = no deadline)
    pub transaction_timeout_ms: u64,
    /// How rows are assigned to partitions
    pub partition_strategy: PartitionStrategy,
    /// How failures propagate between partitions
    pub failure_policy: FailurePolicy,
    /// Upper bound on a single rollback call during forced termination
    pub rollback_timeout_ms: u64,
}

impl ParallelOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the parallelism (clamped to at least 1)
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the per-transaction timeout in milliseconds
    pub fn with_transaction_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.transaction_timeout_ms = timeout_ms;
        self
    }

    /// Set the partition strategy
    pub fn with_partition_strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.partition_strategy = strategy;
        self
    }

    /// Set the failure policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the rollback timeout in milliseconds
    pub fn with_rollback_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rollback_timeout_ms = timeout_ms;
        self
    }

    /// Per-transaction timeout, `None` when transactions have no deadline
    pub fn transaction_timeout(&self) -> Option<Duration> {
        (self.transaction_timeout_ms > 0).then(|| Duration::from_millis(self.transaction_timeout_ms))
    }

    /// Rollback timeout as a Duration
    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            transaction_timeout_ms: 0,
            partition_strategy: PartitionStrategy::default(),
            failure_policy: FailurePolicy::default(),
            rollback_timeout_ms: 5_000,
        }
    }
}

/// Settings file layout
///
/// ```toml
/// [executor]
/// parallelism = 8
/// transaction_timeout_ms = 60000
/// failure_policy = "isolated"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub executor: ParallelOptions,
}

impl ExecutorSettings {
    /// Parse settings from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)
            .map_err(|e| TxGuardError::Configuration(format!("Invalid executor settings: {}", e)))?;
        if settings.executor.parallelism == 0 {
            return Err(TxGuardError::Configuration(
                "executor.parallelism must be at least 1".into(),
            ));
        }
        Ok(settings)
    }

    /// Read and parse a settings file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loaded executor settings");
        Self::from_toml_str(&text)
    }
}
