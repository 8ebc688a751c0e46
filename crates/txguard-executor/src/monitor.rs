//! Deadline and cancellation watcher for a single transaction

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::handle::{HandleState, TransactionHandle};

/// Background task that force-terminates a handle when its deadline passes
/// or when the call broadcasts cancellation.
///
/// The monitor and the owning worker race to end the handle; the handle's
/// compare-and-swap decides the winner, so the monitor firing after a commit
/// is harmless.
pub struct TimeoutMonitor {
    disarm: CancellationToken,
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimeoutMonitor {
    /// Start watching `handle`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(handle: Arc<TransactionHandle>, broadcast: CancellationToken) -> Self {
        let disarm = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn({
            let disarm = disarm.clone();
            let fired = fired.clone();
            async move {
                let deadline = handle.deadline();
                let expiry = async move {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;

                    _ = disarm.cancelled() => {}
                    _ = expiry => {
                        if handle.terminate(HandleState::TimedOut).await {
                            fired.store(true, Ordering::Release);
                            tracing::warn!(
                                transaction = %handle.id(),
                                "transaction exceeded its deadline and was rolled back"
                            );
                        }
                    }
                    _ = broadcast.cancelled() => {
                        if handle.terminate(HandleState::RolledBack).await {
                            fired.store(true, Ordering::Release);
                            tracing::debug!(
                                transaction = %handle.id(),
                                "transaction rolled back on cancellation"
                            );
                        }
                    }
                }
            }
        });

        Self { disarm, fired, task }
    }

    /// Whether the monitor has force-terminated its handle
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Stop the monitor and wait for it to finish.
    ///
    /// A termination already in progress completes before this returns, so
    /// once disarmed the handle's state is final. Returns whether the monitor
    /// fired.
    pub async fn disarm(self) -> bool {
        self.disarm.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "timeout monitor task failed");
        }
        self.fired.load(Ordering::Acquire)
    }
}
