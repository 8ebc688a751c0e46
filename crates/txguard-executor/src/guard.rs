//! Per-call bookkeeping of open transaction handles

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use txguard_core::{Result, TxGuardError};

use crate::handle::{HandleState, TransactionHandle, TransactionId};

/// Shared state of one parallel call.
///
/// Tracks every handle that has been opened and not yet ended, and carries the
/// broadcast cancellation token every worker and monitor listens on. Handles
/// are held weakly so the guard never keeps a transaction alive by itself.
pub struct GuardState {
    active: Mutex<HashMap<TransactionId, Weak<TransactionHandle>>>,
    opened: AtomicUsize,
    cancelled: AtomicBool,
    token: CancellationToken,
}

impl GuardState {
    pub fn new() -> Arc<Self> {
        Self::with_token(CancellationToken::new())
    }

    /// Build a guard whose broadcast is `token`.
    ///
    /// Pass a child of the caller's token so that caller cancellation reaches
    /// the workers while the call's own broadcast stays local.
    pub fn with_token(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(HashMap::new()),
            opened: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            token,
        })
    }

    pub(crate) fn register(&self, handle: &Arc<TransactionHandle>) {
        self.active.lock().insert(handle.id(), Arc::downgrade(handle));
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deregister(&self, id: TransactionId) -> bool {
        self.active.lock().remove(&id).is_some()
    }

    /// Handles opened and not yet ended
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Handles opened over the lifetime of the call
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Broadcast cancellation to every worker and monitor of the call
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!(active = self.active_count(), "broadcasting cancellation");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Verify that no handle is still open, force-terminating any that are.
    ///
    /// Every worker ends its own handle before returning, so a leftover here
    /// is a defect. It is rolled back and reported as `InternalConsistency`.
    /// Returns only once every leftover has finished ending, including those
    /// whose rollback another party started.
    pub async fn teardown(&self) -> Result<()> {
        let leftovers: Vec<(TransactionId, Weak<TransactionHandle>)> = self
            .active
            .lock()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        if leftovers.is_empty() {
            return Ok(());
        }

        tracing::error!(
            count = leftovers.len(),
            "transaction handles still open after all workers finished, forcing rollback"
        );
        // A leftover may already be claimed by its monitor with the driver
        // rollback still running; wait for that instead of racing it.
        futures::future::join_all(leftovers.iter().map(|(id, handle)| async move {
            let Some(handle) = handle.upgrade() else {
                self.deregister(*id);
                return;
            };
            if !handle.terminate(HandleState::RolledBack).await && !handle.wait_ended().await {
                tracing::error!(
                    transaction = %id,
                    state = ?handle.state(),
                    "transaction did not finish ending in time"
                );
            }
        }))
        .await;

        let ids: Vec<String> = leftovers.iter().map(|(id, _)| id.to_string()).collect();
        Err(TxGuardError::InternalConsistency(format!(
            "{} transaction(s) left open: {}",
            ids.len(),
            ids.join(", ")
        )))
    }
}

impl std::fmt::Debug for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardState")
            .field("active", &self.active_count())
            .field("opened", &self.opened_count())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
