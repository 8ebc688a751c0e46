//! Transaction handles
//!
//! A [`TransactionHandle`] wraps one driver transaction and owns its state
//! machine. Two parties may try to end a transaction: the worker that owns it
//! (commit or rollback) and its timeout monitor (forced rollback). Each of them
//! claims the terminal state with a single compare-and-swap out of `Open`, so
//! exactly one of them ever talks to the driver about ending it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use txguard_core::{DriverTransaction, ParameterRow, Result, Row, TransactionDriver, TxGuardError};
use uuid::Uuid;

use crate::guard::GuardState;

/// Identifier of a transaction handle, unique across all calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transaction handle
///
/// `Open` is the only non-terminal state and terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HandleState {
    Open = 0,
    Committed = 1,
    RolledBack = 2,
    TimedOut = 3,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        self != Self::Open
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Committed,
            2 => Self::RolledBack,
            _ => Self::TimedOut,
        }
    }
}

/// One open transaction plus the state machine guarding its end
pub struct TransactionHandle {
    id: TransactionId,
    state: AtomicU8,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    inner: Box<dyn DriverTransaction>,
    guard: Arc<GuardState>,
    rollback_timeout: Duration,
    ended: CancellationToken,
}

impl TransactionHandle {
    /// Begin a driver transaction and register the handle with `guard`.
    ///
    /// The deadline is `now + timeout`; `None` means the transaction never
    /// times out on its own.
    pub async fn open(
        driver: &dyn TransactionDriver,
        guard: &Arc<GuardState>,
        timeout: Option<Duration>,
        rollback_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let inner = driver.begin_transaction(timeout).await?;
        let handle = Arc::new(Self {
            id: TransactionId::new(),
            state: AtomicU8::new(HandleState::Open as u8),
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            inner,
            guard: guard.clone(),
            rollback_timeout,
            ended: CancellationToken::new(),
        });
        guard.register(&handle);
        tracing::debug!(
            transaction = %handle.id,
            driver = driver.driver_name(),
            timeout = ?timeout,
            "transaction opened"
        );
        Ok(handle)
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn deadline_error(&self) -> TxGuardError {
        TxGuardError::DeadlineExceeded(format!(
            "transaction {} exceeded its timeout of {:?}",
            self.id,
            self.timeout.unwrap_or_default()
        ))
    }

    /// Move `Open -> target`; false if another party already ended the handle
    fn claim(&self, target: HandleState) -> bool {
        self.state
            .compare_exchange(
                HandleState::Open as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Run one statement inside the transaction.
    ///
    /// Fails without touching the driver when the handle is no longer open or
    /// its deadline has passed. A statement still running at the deadline is
    /// abandoned and reported as `DeadlineExceeded`; the monitor rolls the
    /// transaction back.
    pub async fn execute(&self, statement: &str, parameters: &ParameterRow) -> Result<Vec<Row>> {
        match self.state() {
            HandleState::Open => {}
            HandleState::TimedOut => return Err(self.deadline_error()),
            state => {
                return Err(TxGuardError::Statement(format!(
                    "transaction {} is {:?}, no further statements may run",
                    self.id, state
                )));
            }
        }
        if self.deadline_passed() {
            return Err(self.deadline_error());
        }

        let run = self.inner.run(statement, parameters);
        let result = match self.deadline {
            Some(deadline) => tokio::select! {
                result = run => result,
                _ = tokio::time::sleep_until(deadline) => Err(self.deadline_error()),
            },
            None => run.await,
        };

        result.map_err(|e| {
            if self.state() == HandleState::TimedOut {
                self.deadline_error()
            } else {
                e
            }
        })
    }

    /// Commit the transaction.
    ///
    /// If the handle is already terminal this is a logged no-op returning
    /// `Ok`; callers read [`state`](Self::state) afterwards to learn how the
    /// transaction actually ended. A failed driver commit rolls back, leaves
    /// the handle `RolledBack` and returns a `Commit` error, unless the driver
    /// refused because the deadline had passed: then the handle ends
    /// `TimedOut` and the `DeadlineExceeded` error is returned as is.
    pub async fn commit(&self) -> Result<()> {
        if !self.claim(HandleState::Committed) {
            tracing::warn!(
                transaction = %self.id,
                state = ?self.state(),
                "commit on terminated transaction ignored"
            );
            return Ok(());
        }

        let result = self.inner.commit().await;
        if let Err(e) = &result {
            tracing::warn!(transaction = %self.id, error = %e, "commit failed, rolling back");
            let terminal = match e {
                TxGuardError::DeadlineExceeded(_) => HandleState::TimedOut,
                _ => HandleState::RolledBack,
            };
            self.state.store(terminal as u8, Ordering::Release);
            self.bounded_rollback().await;
        } else {
            tracing::debug!(transaction = %self.id, "transaction committed");
        }
        self.finish();

        result.map_err(|e| match e {
            TxGuardError::Commit(_) | TxGuardError::DeadlineExceeded(_) => e,
            other => TxGuardError::Commit(other.to_string()),
        })
    }

    /// Roll back the transaction; a no-op if it already ended
    pub async fn rollback(&self) -> bool {
        self.terminate(HandleState::RolledBack).await
    }

    /// Force the handle into `target` (`RolledBack` or `TimedOut`) and roll the
    /// driver transaction back.
    ///
    /// Returns whether this call performed the transition.
    pub async fn terminate(&self, target: HandleState) -> bool {
        debug_assert!(matches!(target, HandleState::RolledBack | HandleState::TimedOut));
        if !self.claim(target) {
            tracing::debug!(
                transaction = %self.id,
                state = ?self.state(),
                requested = ?target,
                "transaction already terminated"
            );
            return false;
        }

        self.bounded_rollback().await;
        self.finish();
        tracing::debug!(transaction = %self.id, state = ?target, "transaction rolled back");
        true
    }

    /// Wait until whoever claimed the handle has finished ending it.
    ///
    /// Bounded by the rollback timeout; returns false if it ran out.
    pub async fn wait_ended(&self) -> bool {
        tokio::time::timeout(self.rollback_timeout, self.ended.cancelled())
            .await
            .is_ok()
    }

    fn finish(&self) {
        self.guard.deregister(self.id);
        self.ended.cancel();
    }

    async fn bounded_rollback(&self) {
        if tokio::time::timeout(self.rollback_timeout, self.inner.rollback())
            .await
            .is_err()
        {
            tracing::error!(
                transaction = %self.id,
                timeout = ?self.rollback_timeout,
                "driver rollback did not finish in time"
            );
        }
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.state() == HandleState::Open {
            // The driver transaction rolls itself back when `inner` drops
            tracing::warn!(transaction = %self.id, "transaction handle dropped while open");
        }
        self.finish();
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            HandleState::Open,
            HandleState::Committed,
            HandleState::RolledBack,
            HandleState::TimedOut,
        ] {
            assert_eq!(HandleState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_only_open_is_non_terminal() {
        assert!(!HandleState::Open.is_terminal());
        assert!(HandleState::Committed.is_terminal());
        assert!(HandleState::RolledBack.is_terminal());
        assert!(HandleState::TimedOut.is_terminal());
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| TransactionId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
