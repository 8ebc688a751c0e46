//! Execution of one partition inside one transaction

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use txguard_core::{Result, Row, TransactionDriver, TxGuardError};

use crate::guard::GuardState;
use crate::handle::{HandleState, TransactionHandle, TransactionId};
use crate::monitor::TimeoutMonitor;
use crate::partition::Partition;
use crate::result::ExecutionResult;
use crate::work::WorkItem;

/// Runs every row of a partition in a single transaction and ends it.
///
/// Whatever happens, including cancellation and timeout, the handle the worker
/// opened is terminal when [`run`](Self::run) returns.
pub struct Worker {
    partition: Partition,
    item: Arc<WorkItem>,
    driver: Arc<dyn TransactionDriver>,
    guard: Arc<GuardState>,
    timeout: Option<Duration>,
    rollback_timeout: Duration,
}

impl Worker {
    pub fn new(
        partition: Partition,
        item: Arc<WorkItem>,
        driver: Arc<dyn TransactionDriver>,
        guard: Arc<GuardState>,
        timeout: Option<Duration>,
        rollback_timeout: Duration,
    ) -> Self {
        Self {
            partition,
            item,
            driver,
            guard,
            timeout,
            rollback_timeout,
        }
    }

    #[tracing::instrument(
        name = "partition",
        skip_all,
        fields(index = self.partition.index, rows = self.partition.len())
    )]
    pub async fn run(self) -> ExecutionResult {
        let start = Instant::now();
        let index = self.partition.index;
        let cancel = self.guard.cancellation_token().clone();

        if cancel.is_cancelled() {
            return ExecutionResult::failed(index, None, TxGuardError::Cancelled, start.elapsed());
        }

        let opened = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(TxGuardError::Cancelled),
            opened = TransactionHandle::open(
                self.driver.as_ref(),
                &self.guard,
                self.timeout,
                self.rollback_timeout,
            ) => opened,
        };
        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!(error = %e, "could not open transaction");
                return ExecutionResult::failed(index, None, e, start.elapsed());
            }
        };

        let monitor = TimeoutMonitor::arm(handle.clone(), cancel.clone());
        let outcome = match self.execute_rows(&handle, &cancel).await {
            Ok(rows) => handle.commit().await.map(|()| rows),
            Err(e) => {
                handle.rollback().await;
                Err(e)
            }
        };
        monitor.disarm().await;

        let outcome = settle(handle.id(), handle.state(), outcome);
        if let Err(e) = &outcome {
            tracing::debug!(transaction = %handle.id(), error = %e, "partition failed");
        }

        ExecutionResult {
            partition_index: index,
            transaction_id: Some(handle.id()),
            outcome,
            elapsed: start.elapsed(),
        }
    }

    async fn execute_rows(
        &self,
        handle: &TransactionHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>> {
        let mut output = Vec::new();
        for row in &self.partition.rows {
            if cancel.is_cancelled() {
                return Err(TxGuardError::Cancelled);
            }
            let parameters = self.item.bind(row);
            let rows = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(TxGuardError::Cancelled),
                result = handle.execute(self.item.statement(), &parameters) => result?,
            };
            output.extend(rows);
        }
        Ok(output)
    }
}

/// Reconcile the worker's view of the outcome with how the handle actually ended
fn settle(id: TransactionId, state: HandleState, outcome: Result<Vec<Row>>) -> Result<Vec<Row>> {
    match (state, outcome) {
        (HandleState::Committed, outcome) => outcome,
        (HandleState::TimedOut, _) => Err(TxGuardError::DeadlineExceeded(format!(
            "transaction {} was rolled back at its deadline",
            id
        ))),
        // Terminated by the broadcast after the last row but before commit
        (HandleState::RolledBack, Ok(_)) => Err(TxGuardError::Cancelled),
        (HandleState::RolledBack, Err(e)) => Err(e),
        (HandleState::Open, _) => Err(TxGuardError::InternalConsistency(format!(
            "transaction {} still open after its worker finished",
            id
        ))),
    }
}
