//! Common test utilities and mocks

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use txguard_core::{
    DriverTransaction, ParameterRow, Result, Row, TransactionDriver, TxGuardError, Value,
};

static TRACING: Once = Once::new();

/// Route executor logs to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// What the mock does with one statement
#[derive(Debug, Clone)]
pub enum Step {
    /// Return one row echoing the bound parameters
    Echo,
    /// Wait, then echo
    Sleep(Duration),
    /// Fail with a statement error
    Fail(String),
    /// Block until the transaction is terminated
    Hang,
    /// Panic inside the driver
    Panic,
}

/// How a mock transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    Committed,
    RolledBack,
    Dropped,
}

type Script = Arc<dyn Fn(&str, &ParameterRow) -> Step + Send + Sync>;

/// Counters shared between a [`MockDriver`] and its transactions
#[derive(Default)]
pub struct MockStats {
    pub begun: AtomicUsize,
    pub committed: AtomicUsize,
    pub rolled_back: AtomicUsize,
    pub statements: AtomicUsize,
    /// Commit or rollback issued on an already ended transaction
    pub redundant_endings: AtomicUsize,
    open: Mutex<HashSet<u64>>,
    endings: Mutex<HashMap<u64, Vec<Ending>>>,
}

impl MockStats {
    fn end(&self, id: u64, ending: Ending) {
        self.open.lock().remove(&id);
        self.endings.lock().entry(id).or_default().push(ending);
        match ending {
            Ending::Committed => self.committed.fetch_add(1, Ordering::SeqCst),
            Ending::RolledBack | Ending::Dropped => self.rolled_back.fetch_add(1, Ordering::SeqCst),
        };
    }
}

/// Scriptable in-memory transaction driver
pub struct MockDriver {
    script: Script,
    stats: Arc<MockStats>,
    next_id: AtomicU64,
    begin_attempts: AtomicUsize,
    fail_begin_from: Option<usize>,
    fail_commit: Option<CommitFailure>,
    commit_delay: Duration,
    rollback_delay: Duration,
}

type CommitFailure = fn(u64) -> TxGuardError;

impl MockDriver {
    /// Every statement echoes its parameters
    pub fn echo() -> Self {
        Self::scripted(|_, _| Step::Echo)
    }

    pub fn scripted(script: impl Fn(&str, &ParameterRow) -> Step + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            stats: Arc::new(MockStats::default()),
            next_id: AtomicU64::new(1),
            begin_attempts: AtomicUsize::new(0),
            fail_begin_from: None,
            fail_commit: None,
            commit_delay: Duration::ZERO,
            rollback_delay: Duration::ZERO,
        }
    }

    /// Refuse every `begin_transaction` after the first `n`
    pub fn failing_begin_after(mut self, n: usize) -> Self {
        self.fail_begin_from = Some(n);
        self
    }

    /// Every commit fails and leaves the transaction open until rolled back
    pub fn failing_commits(mut self) -> Self {
        self.fail_commit = Some(|_| TxGuardError::Commit("simulated commit failure".into()));
        self
    }

    /// Every commit is refused because the transaction's deadline has passed
    pub fn commits_past_deadline(mut self) -> Self {
        self.fail_commit = Some(|id| {
            TxGuardError::DeadlineExceeded(format!("transaction {} timed out before commit", id))
        });
        self
    }

    /// Rollback takes `delay` before the transaction is closed
    pub fn with_rollback_delay(mut self, delay: Duration) -> Self {
        self.rollback_delay = delay;
        self
    }

    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    pub fn stats(&self) -> &MockStats {
        &self.stats
    }

    pub fn begun(&self) -> usize {
        self.stats.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> usize {
        self.stats.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.stats.rolled_back.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> usize {
        self.stats.statements.load(Ordering::SeqCst)
    }

    pub fn redundant_endings(&self) -> usize {
        self.stats.redundant_endings.load(Ordering::SeqCst)
    }

    /// Transactions that ended more than once or never
    pub fn inconsistent_transactions(&self) -> Vec<u64> {
        let endings = self.stats.endings.lock();
        let begun = self.next_id.load(Ordering::SeqCst);
        (1..begun)
            .filter(|id| endings.get(id).map_or(0, Vec::len) != 1)
            .collect()
    }

    /// Wait until no transaction is open or `limit` elapses
    pub async fn wait_until_idle(&self, limit: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let open = self.list_open_transactions();
            if open == 0 || tokio::time::Instant::now() >= deadline {
                return open;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl TransactionDriver for MockDriver {
    fn driver_name(&self) -> &str {
        "mock"
    }

    async fn begin_transaction(
        &self,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn DriverTransaction>> {
        let attempt = self.begin_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_begin_from
            && attempt >= limit
        {
            return Err(TxGuardError::Connection("connection pool exhausted".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.stats.begun.fetch_add(1, Ordering::SeqCst);
        self.stats.open.lock().insert(id);

        Ok(Box::new(MockTransaction {
            id,
            script: self.script.clone(),
            stats: self.stats.clone(),
            closed: AtomicBool::new(false),
            terminated: CancellationToken::new(),
            fail_commit: self.fail_commit,
            commit_delay: self.commit_delay,
            rollback_delay: self.rollback_delay,
        }))
    }

    fn list_open_transactions(&self) -> usize {
        self.stats.open.lock().len()
    }
}

pub struct MockTransaction {
    id: u64,
    script: Script,
    stats: Arc<MockStats>,
    closed: AtomicBool,
    terminated: CancellationToken,
    fail_commit: Option<CommitFailure>,
    commit_delay: Duration,
    rollback_delay: Duration,
}

fn echo_row(parameters: &ParameterRow) -> Row {
    Row::new(
        parameters.keys().cloned().collect(),
        parameters.values().cloned().collect(),
    )
}

#[async_trait]
impl DriverTransaction for MockTransaction {
    async fn run(&self, statement: &str, parameters: &ParameterRow) -> Result<Vec<Row>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TxGuardError::Statement(format!("transaction {} is closed", self.id)));
        }
        self.stats.statements.fetch_add(1, Ordering::SeqCst);

        let step = (self.script)(statement, parameters);
        let work = async {
            match step {
                Step::Echo => Ok(vec![echo_row(parameters)]),
                Step::Sleep(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(vec![echo_row(parameters)])
                }
                Step::Fail(message) => Err(TxGuardError::Statement(message)),
                Step::Hang => std::future::pending().await,
                Step::Panic => panic!("mock driver panicked in transaction {}", self.id),
            }
        };

        tokio::select! {
            biased;

            _ = self.terminated.cancelled() => Err(TxGuardError::Statement(format!(
                "transaction {} terminated",
                self.id
            ))),
            result = work => result,
        }
    }

    async fn commit(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            self.stats.redundant_endings.fetch_add(1, Ordering::SeqCst);
            return Err(TxGuardError::Commit(format!("transaction {} is closed", self.id)));
        }
        if !self.commit_delay.is_zero() {
            tokio::time::sleep(self.commit_delay).await;
        }
        if let Some(failure) = self.fail_commit {
            return Err(failure(self.id));
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            self.stats.redundant_endings.fetch_add(1, Ordering::SeqCst);
            return Err(TxGuardError::Commit(format!("transaction {} is closed", self.id)));
        }
        self.stats.end(self.id, Ending::Committed);
        Ok(())
    }

    async fn rollback(&self) {
        self.terminated.cancel();
        if !self.rollback_delay.is_zero() {
            tokio::time::sleep(self.rollback_delay).await;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            self.stats.redundant_endings.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.stats.end(self.id, Ending::RolledBack);
    }
}

impl Drop for MockTransaction {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.end(self.id, Ending::Dropped);
        }
    }
}

/// Batch of `n` rows binding `key` to `0..n`
pub fn int_batch(key: &str, n: i64) -> Vec<ParameterRow> {
    (0..n)
        .map(|i| ParameterRow::from([(key.to_string(), Value::Int64(i))]))
        .collect()
}

/// Value bound to `key` in a statement's parameters
pub fn param_i64(parameters: &ParameterRow, key: &str) -> i64 {
    parameters.get(key).and_then(Value::as_i64).unwrap_or(-1)
}
