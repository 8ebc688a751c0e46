//! Per-partition results and the call summary

use std::time::Duration;

use serde::Serialize;
use txguard_core::{ErrorKind, Result, Row, TxGuardError};

use crate::handle::TransactionId;

/// Outcome of one partition
#[derive(Debug)]
pub struct ExecutionResult {
    pub partition_index: usize,
    /// `None` only when no transaction could be opened for the partition
    pub transaction_id: Option<TransactionId>,
    pub outcome: Result<Vec<Row>>,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn failed(
        partition_index: usize,
        transaction_id: Option<TransactionId>,
        error: TxGuardError,
        elapsed: Duration,
    ) -> Self {
        Self {
            partition_index,
            transaction_id,
            outcome: Err(error),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.outcome.as_ref().err().map(TxGuardError::kind)
    }

    /// Output rows, if the partition committed
    pub fn rows(&self) -> Option<&[Row]> {
        self.outcome.as_deref().ok()
    }
}

/// Aggregate view of a call, for logs and CLI output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub partitions: usize,
    pub rows_in: usize,
    pub rows_out: usize,
    pub succeeded: usize,
    /// Failures caused by the partition itself
    pub failed: usize,
    /// Partitions stopped by cancellation rather than their own failure
    pub cancelled: usize,
    pub elapsed_ms: u64,
}

impl ExecutionSummary {
    pub fn from_results(results: &[ExecutionResult], rows_in: usize, elapsed: Duration) -> Self {
        let mut summary = Self {
            partitions: results.len(),
            rows_in,
            elapsed_ms: elapsed.as_millis() as u64,
            ..Self::default()
        };
        for result in results {
            match &result.outcome {
                Ok(rows) => {
                    summary.succeeded += 1;
                    summary.rows_out += rows.len();
                }
                Err(e) if e.is_cancellation() => summary.cancelled += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}
