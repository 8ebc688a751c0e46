//! SQLite transaction

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use txguard_core::{DriverTransaction, ParameterRow, Result, Row, TxGuardError};

use crate::driver::{PoolShared, PooledSqlite};

/// A transaction pinned to one pooled SQLite connection.
///
/// The host-side `timeout` passed at begin is enforced here: a statement still
/// running when it elapses is interrupted and reported as
/// `TxGuardError::DeadlineExceeded`, and the transaction can no longer commit.
pub struct SqliteTransaction {
    id: u64,
    conn: Arc<PooledSqlite>,
    shared: Arc<PoolShared>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    closed: AtomicBool,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl SqliteTransaction {
    pub(crate) fn new(
        id: u64,
        conn: Arc<PooledSqlite>,
        shared: Arc<PoolShared>,
        permit: OwnedSemaphorePermit,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            conn,
            shared,
            permit: Mutex::new(Some(permit)),
            closed: AtomicBool::new(false),
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Driver-local transaction id
    pub fn id(&self) -> u64 {
        self.id
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn timed_out_error(&self) -> TxGuardError {
        TxGuardError::DeadlineExceeded(format!(
            "transaction {} exceeded its timeout of {:?}",
            self.id,
            self.timeout.unwrap_or_default()
        ))
    }

    /// Return the connection and the pool slot
    fn release(&self, reusable: bool) {
        self.shared.release(self.id, self.conn.clone(), reusable);
        self.permit.lock().take();
    }

    async fn rollback_connection(&self) -> bool {
        self.conn.interrupt_running();
        let conn = self.conn.clone();
        match tokio::task::spawn_blocking(move || conn.rollback_quietly()).await {
            Ok(reusable) => reusable,
            Err(e) => {
                tracing::error!(transaction = self.id, error = %e, "rollback task failed");
                false
            }
        }
    }
}

#[async_trait]
impl DriverTransaction for SqliteTransaction {
    async fn run(&self, statement: &str, parameters: &ParameterRow) -> Result<Vec<Row>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TxGuardError::Statement(format!(
                "transaction {} is closed",
                self.id
            )));
        }
        let remaining = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(self.timed_out_error());
                }
                Some(deadline - now)
            }
            None => None,
        };

        tracing::trace!(
            transaction = self.id,
            sql_preview = %statement.chars().take(100).collect::<String>(),
            "running statement in SQLite transaction"
        );

        let conn = self.conn.clone();
        let sql = statement.to_string();
        let params = parameters.clone();
        let mut task = tokio::task::spawn_blocking(move || conn.run(&sql, &params));

        let joined = match remaining {
            Some(remaining) => match tokio::time::timeout(remaining, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(transaction = self.id, "SQLite transaction timed out mid-statement, interrupting");
                    self.conn.interrupt_running();
                    let _ = task.await;
                    return Err(self.timed_out_error());
                }
            },
            None => task.await,
        };

        let result = joined
            .map_err(|e| TxGuardError::Statement(format!("Statement task failed: {}", e)))?;
        result.map_err(|e| {
            if self.closed.load(Ordering::Acquire) {
                TxGuardError::Statement(format!(
                    "transaction {} was terminated while a statement was running",
                    self.id
                ))
            } else {
                e
            }
        })
    }

    async fn commit(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TxGuardError::Commit(format!(
                "transaction {} is already closed",
                self.id
            )));
        }

        if self.deadline_passed() {
            let reusable = self.rollback_connection().await;
            self.release(reusable);
            return Err(self.timed_out_error());
        }

        let conn = self.conn.clone();
        let committed = tokio::task::spawn_blocking(move || conn.commit())
            .await
            .map_err(|e| TxGuardError::Commit(format!("Commit task failed: {}", e)))
            .and_then(|r| r);

        match committed {
            Ok(()) => {
                tracing::debug!(transaction = self.id, "SQLite transaction committed");
                self.release(true);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(transaction = self.id, error = %e, "commit failed, rolling back");
                let reusable = self.rollback_connection().await;
                self.release(reusable);
                Err(e)
            }
        }
    }

    async fn rollback(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(transaction = self.id, "rollback on closed SQLite transaction ignored");
            return;
        }
        let reusable = self.rollback_connection().await;
        tracing::debug!(transaction = self.id, "SQLite transaction rolled back");
        self.release(reusable);
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        // Abandoned without commit or rollback: roll back synchronously so the
        // connection is never returned with a transaction still open.
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::warn!(transaction = self.id, "SQLite transaction dropped while open, issuing automatic rollback");
            self.conn.interrupt_running();
            let reusable = self.conn.rollback_quietly();
            self.release(reusable);
        }
    }
}
