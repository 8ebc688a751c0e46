//! Parallel executor
//!
//! Splits a batch into partitions, runs each partition in its own transaction
//! on its own task, and returns only once every transaction it opened has been
//! committed or rolled back. The number of transactions open on the driver
//! after a call equals the number before it, on every exit path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use txguard_core::{ParameterRow, Result, TransactionDriver, TxGuardError};

use crate::config::{FailurePolicy, ParallelOptions};
use crate::guard::GuardState;
use crate::partition::partition;
use crate::result::{ExecutionResult, ExecutionSummary};
use crate::work::WorkItem;
use crate::worker::Worker;

/// Runs a statement over a batch of parameter rows in parallel transactions
pub struct ParallelExecutor {
    driver: Arc<dyn TransactionDriver>,
    options: ParallelOptions,
}

impl ParallelExecutor {
    pub fn new(driver: Arc<dyn TransactionDriver>, options: ParallelOptions) -> Self {
        Self { driver, options }
    }

    pub fn options(&self) -> &ParallelOptions {
        &self.options
    }

    pub fn driver(&self) -> &Arc<dyn TransactionDriver> {
        &self.driver
    }

    /// Execute `item` once per row of `batch`.
    ///
    /// With [`FailurePolicy::FailTogether`] the first partition failure
    /// cancels the others and is returned as the error; otherwise one
    /// [`ExecutionResult`] per partition is returned in partition order.
    pub async fn execute(
        &self,
        item: WorkItem,
        batch: Vec<ParameterRow>,
    ) -> Result<Vec<ExecutionResult>> {
        self.execute_with_cancellation(item, batch, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), stopping early when `cancel` fires.
    ///
    /// Caller cancellation is a failure of the whole call (`Cancelled`).
    /// Dropping the returned future also cancels the call; every transaction
    /// it opened is still rolled back in the background.
    #[tracing::instrument(
        name = "parallel_execute",
        skip_all,
        fields(
            sql_preview = %item.preview(),
            rows = batch.len(),
            parallelism = self.options.parallelism,
            policy = ?self.options.failure_policy,
        )
    )]
    pub async fn execute_with_cancellation(
        &self,
        item: WorkItem,
        batch: Vec<ParameterRow>,
        cancel: CancellationToken,
    ) -> Result<Vec<ExecutionResult>> {
        let start = Instant::now();
        let rows_in = batch.len();
        let partitions = partition(batch, self.options.parallelism, self.options.partition_strategy)?;
        if partitions.is_empty() {
            tracing::debug!("empty batch, nothing to execute");
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(TxGuardError::Cancelled);
        }

        let partition_count = partitions.len();
        let guard = GuardState::with_token(cancel.child_token());
        let _cancel_on_drop = guard.cancellation_token().clone().drop_guard();
        let item = Arc::new(item);
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism));
        let timeout = self.options.transaction_timeout();
        let rollback_timeout = self.options.rollback_timeout();

        let mut workers = JoinSet::new();
        for partition in partitions {
            let index = partition.index;
            let worker = Worker::new(
                partition,
                item.clone(),
                self.driver.clone(),
                guard.clone(),
                timeout,
                rollback_timeout,
            );
            let semaphore = semaphore.clone();
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                match AssertUnwindSafe(worker.run()).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => ExecutionResult::failed(
                        index,
                        None,
                        TxGuardError::Statement(format!("worker for partition {} panicked", index)),
                        Duration::ZERO,
                    ),
                }
            });
        }

        let mut slots: Vec<Option<ExecutionResult>> = (0..partition_count).map(|_| None).collect();
        let mut first_failure: Option<usize> = None;
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "worker task did not complete");
                    continue;
                }
            };

            if let Err(e) = &result.outcome {
                tracing::debug!(partition = result.partition_index, error = %e, "partition failed");
                if self.options.failure_policy == FailurePolicy::FailTogether
                    && first_failure.is_none()
                {
                    first_failure = Some(result.partition_index);
                    guard.cancel();
                }
            }
            let index = result.partition_index;
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }

        if let Err(e) = guard.teardown().await {
            tracing::error!(error = %e, "transaction guard found handles left open");
        }

        let results: Vec<ExecutionResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    ExecutionResult::failed(
                        index,
                        None,
                        TxGuardError::Statement(format!(
                            "worker for partition {} ended without a result",
                            index
                        )),
                        Duration::ZERO,
                    )
                })
            })
            .collect();

        let summary = ExecutionSummary::from_results(&results, rows_in, start.elapsed());
        tracing::info!(
            partitions = summary.partitions,
            rows_in = summary.rows_in,
            rows_out = summary.rows_out,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            opened = guard.opened_count(),
            elapsed_ms = summary.elapsed_ms,
            "parallel execution finished"
        );

        if let Some(index) = first_failure {
            return Err(take_error(results, index));
        }
        if cancel.is_cancelled()
            && results
                .iter()
                .any(|r| matches!(&r.outcome, Err(e) if e.is_cancellation()))
        {
            return Err(TxGuardError::Cancelled);
        }
        Ok(results)
    }
}

fn take_error(results: Vec<ExecutionResult>, index: usize) -> TxGuardError {
    results
        .into_iter()
        .nth(index)
        .and_then(|result| result.outcome.err())
        .unwrap_or_else(|| {
            TxGuardError::Statement(format!("failure of partition {} was not recorded", index))
        })
}
