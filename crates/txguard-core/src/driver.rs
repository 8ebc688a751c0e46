//! Transactional driver contract
//!
//! The executor treats the host database as an opaque collaborator. A host
//! plugs in by implementing [`TransactionDriver`], which hands out
//! [`DriverTransaction`]s.

use crate::{ParameterRow, Result, Row};
use async_trait::async_trait;
use std::time::Duration;

/// A host that can open transactions
#[async_trait]
pub trait TransactionDriver: Send + Sync {
    /// Get the driver name (e.g., "sqlite")
    fn driver_name(&self) -> &str;

    /// Begin a new transaction.
    ///
    /// `timeout` is the host-side budget for the transaction, if the host
    /// enforces one. Fails with `TxGuardError::Connection` when no
    /// transaction can be allocated (for example, the connection pool is
    /// exhausted).
    async fn begin_transaction(&self, timeout: Option<Duration>)
    -> Result<Box<dyn DriverTransaction>>;

    /// Number of transactions currently open on this driver.
    ///
    /// Observability hook only; the executor never makes decisions based on it.
    fn list_open_transactions(&self) -> usize;
}

/// A single open transaction on the host
///
/// All methods take `&self` so that a transaction can be terminated from a
/// different task while a statement is still running on it. Implementations
/// must make that safe: a concurrent `rollback` is expected to interrupt an
/// in-flight `run`.
#[async_trait]
pub trait DriverTransaction: Send + Sync {
    /// Run one statement with named parameters inside the transaction.
    ///
    /// Fails with `TxGuardError::Statement` on query failure and
    /// `TxGuardError::DeadlineExceeded` when the host-side timeout fires.
    async fn run(&self, statement: &str, parameters: &ParameterRow) -> Result<Vec<Row>>;

    /// Commit the transaction
    async fn commit(&self) -> Result<()>;

    /// Roll the transaction back.
    ///
    /// Never fails observably: internal errors are logged and swallowed, and
    /// the underlying connection is always released.
    async fn rollback(&self);
}
