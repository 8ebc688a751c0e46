//! Procedure-level entry point
//!
//! [`ParallelProcedure::run`] takes the caller-facing request shape: one
//! statement, a parameter mapping in which `iteration_key` names the list to
//! iterate over, a parallelism and a per-transaction timeout. Arguments are
//! validated before any transaction is opened.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use txguard_core::{ParameterRow, Result, Row, TransactionDriver, TxGuardError, Value};

use crate::config::ParallelOptions;
use crate::executor::ParallelExecutor;
use crate::result::ExecutionResult;
use crate::work::WorkItem;

/// Arguments of one procedure call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelRequest {
    pub statement: String,
    /// Shared parameters plus the list under `iteration_key`
    #[serde(default)]
    pub parameters: ParameterRow,
    pub iteration_key: String,
    pub parallelism: i64,
    /// 0 means no per-transaction deadline
    #[serde(default)]
    pub timeout_per_transaction_ms: i64,
}

impl ParallelRequest {
    pub fn new(
        statement: impl Into<String>,
        parameters: ParameterRow,
        iteration_key: impl Into<String>,
    ) -> Self {
        Self {
            statement: statement.into(),
            parameters,
            iteration_key: iteration_key.into(),
            parallelism: ParallelOptions::default().parallelism as i64,
            timeout_per_transaction_ms: 0,
        }
    }

    pub fn with_parallelism(mut self, parallelism: i64) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_per_transaction_ms = timeout_ms;
        self
    }

    /// Check the request and split it into the shared work item, the batch
    /// and the per-call options.
    pub fn prepare(
        self,
        defaults: &ParallelOptions,
    ) -> Result<(WorkItem, Vec<ParameterRow>, ParallelOptions)> {
        if self.statement.trim().is_empty() {
            return Err(TxGuardError::InvalidArgument("statement is empty".into()));
        }
        if self.parallelism <= 0 {
            return Err(TxGuardError::InvalidArgument(format!(
                "parallelism must be positive, got {}",
                self.parallelism
            )));
        }
        if self.timeout_per_transaction_ms < 0 {
            return Err(TxGuardError::InvalidArgument(format!(
                "timeout must not be negative, got {}ms",
                self.timeout_per_transaction_ms
            )));
        }

        let mut shared = self.parameters;
        let values = match shared.remove(&self.iteration_key) {
            Some(Value::Array(values)) => values,
            Some(other) => {
                return Err(TxGuardError::InvalidArgument(format!(
                    "parameter '{}' must be a list, got {}",
                    self.iteration_key, other
                )));
            }
            None => {
                return Err(TxGuardError::InvalidArgument(format!(
                    "iteration key '{}' is not among the parameters",
                    self.iteration_key
                )));
            }
        };

        let batch = values
            .into_iter()
            .map(|value| ParameterRow::from([(self.iteration_key.clone(), value)]))
            .collect();
        let item = WorkItem::new(self.statement).with_parameters(shared);
        let options = defaults
            .clone()
            .with_parallelism(self.parallelism as usize)
            .with_transaction_timeout_ms(self.timeout_per_transaction_ms as u64);

        Ok((item, batch, options))
    }
}

/// Runs [`ParallelRequest`]s against one driver
pub struct ParallelProcedure {
    driver: Arc<dyn TransactionDriver>,
    defaults: ParallelOptions,
}

impl ParallelProcedure {
    pub fn new(driver: Arc<dyn TransactionDriver>) -> Self {
        Self::with_defaults(driver, ParallelOptions::default())
    }

    /// Use `defaults` for everything the request does not set
    pub fn with_defaults(driver: Arc<dyn TransactionDriver>, defaults: ParallelOptions) -> Self {
        Self { driver, defaults }
    }

    /// Run the request and return the output rows of every committed
    /// partition, in batch order.
    pub async fn run(&self, request: ParallelRequest) -> Result<Vec<Row>> {
        self.run_with_cancellation(request, CancellationToken::new())
            .await
    }

    pub async fn run_with_cancellation(
        &self,
        request: ParallelRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<Row>> {
        let results = self.run_detailed(request, cancel).await?;
        Ok(results
            .into_iter()
            .filter_map(|result| result.outcome.ok())
            .flatten()
            .collect())
    }

    /// Run the request and return one result per partition
    pub async fn run_detailed(
        &self,
        request: ParallelRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<ExecutionResult>> {
        let (item, batch, options) = request.prepare(&self.defaults)?;
        ParallelExecutor::new(self.driver.clone(), options)
            .execute_with_cancellation(item, batch, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> ParallelRequest {
        let parameters = ParameterRow::from([
            (
                "a".to_string(),
                Value::Array(vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]),
            ),
            ("label".to_string(), Value::String("x".into())),
        ]);
        ParallelRequest::new("SELECT :a, :label", parameters, "a")
            .with_parallelism(2)
            .with_timeout_ms(500)
    }

    #[test]
    fn test_prepare_splits_iteration_key() {
        let (item, batch, options) = request().prepare(&ParallelOptions::default()).expect("prepare");

        assert_eq!(item.statement(), "SELECT :a, :label");
        assert_eq!(
            item.parameters(),
            &ParameterRow::from([("label".to_string(), Value::String("x".into()))])
        );
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[1].get("a"), Some(&Value::Int64(2)));
        assert_eq!(options.parallelism, 2);
        assert_eq!(options.transaction_timeout_ms, 500);
    }

    #[test]
    fn test_prepare_keeps_default_policy() {
        let defaults = ParallelOptions::default()
            .with_failure_policy(crate::config::FailurePolicy::Isolated);
        let (_, _, options) = request().prepare(&defaults).expect("prepare");
        assert_eq!(options.failure_policy, crate::config::FailurePolicy::Isolated);
    }

    #[test]
    fn test_request_from_json() {
        let request: ParallelRequest = serde_json::from_value(serde_json::json!({
            "statement": "SELECT :a",
            "parameters": {"a": [1, 2]},
            "iteration_key": "a",
            "parallelism": 2
        }))
        .expect("deserialize");

        assert_eq!(request.timeout_per_transaction_ms, 0);
        assert_eq!(
            request.parameters.get("a"),
            Some(&Value::Array(vec![Value::Int64(1), Value::Int64(2)]))
        );
    }
}
