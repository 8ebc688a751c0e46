//! SQLite driver and its connection set

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection as RusqliteConnection, InterruptHandle, OpenFlags};
use tokio::sync::Semaphore;
use txguard_core::{
    DriverTransaction, ParameterRow, Result, Row, TransactionDriver, TxGuardError,
};

use crate::config::SqliteDriverConfig;
use crate::convert::{bind_parameters, rusqlite_to_value};
use crate::transaction::SqliteTransaction;

/// Granularity at which `sleep(ms)` checks for termination
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// One rusqlite connection plus the handles needed to stop work on it from
/// another thread
pub(crate) struct PooledSqlite {
    conn: Mutex<RusqliteConnection>,
    interrupt_handle: InterruptHandle,
    abort: Arc<AtomicBool>,
}

impl PooledSqlite {
    fn open(location: &str, config: &SqliteDriverConfig) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = RusqliteConnection::open_with_flags(location, flags).map_err(|e| {
            TxGuardError::Connection(format!(
                "Failed to open SQLite database at '{}': {}",
                location, e
            ))
        })?;

        conn.busy_timeout(config.busy_timeout())
            .map_err(|e| TxGuardError::Connection(format!("Failed to set busy timeout: {}", e)))?;

        let abort = Arc::new(AtomicBool::new(false));
        register_functions(&conn, abort.clone())
            .map_err(|e| TxGuardError::Connection(format!("Failed to register functions: {}", e)))?;

        let interrupt_handle = conn.get_interrupt_handle();
        Ok(Self {
            conn: Mutex::new(conn),
            interrupt_handle,
            abort,
        })
    }

    /// Stop whatever statement is running on this connection
    pub(crate) fn interrupt_running(&self) {
        self.abort.store(true, Ordering::Release);
        self.interrupt_handle.interrupt();
    }

    pub(crate) fn begin(&self) -> Result<()> {
        self.abort.store(false, Ordering::Release);
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN DEFERRED")
            .map_err(|e| TxGuardError::Connection(format!("Failed to begin transaction: {}", e)))
    }

    pub(crate) fn run(&self, sql: &str, params: &ParameterRow) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| TxGuardError::Statement(format!("Failed to prepare statement: {}", e)))?;
        bind_parameters(&mut stmt, params)?;

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| TxGuardError::Statement(format!("Statement failed: {}", e)))?
        {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(rusqlite_to_value(row, idx)?);
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    pub(crate) fn commit(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("COMMIT")
            .map_err(|e| TxGuardError::Commit(format!("Failed to commit transaction: {}", e)))
    }

    /// Roll back whatever is open on this connection, logging failures.
    ///
    /// Returns whether the connection is clean enough to be reused.
    pub(crate) fn rollback_quietly(&self) -> bool {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            // SQLite already rolled back, e.g. after an interrupted write
            return true;
        }
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "SQLite rollback failed, discarding connection");
                false
            }
        }
    }
}

fn register_functions(
    conn: &RusqliteConnection,
    abort: Arc<AtomicBool>,
) -> rusqlite::Result<()> {
    conn.create_scalar_function("sleep", 1, FunctionFlags::SQLITE_UTF8, move |ctx| {
        let ms: i64 = ctx.get(0)?;
        let deadline = Instant::now() + Duration::from_millis(ms.max(0) as u64);
        loop {
            if abort.load(Ordering::Acquire) {
                return Err(rusqlite::Error::UserFunctionError(
                    "sleep aborted: transaction terminated".into(),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(ms);
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    })
}

/// State shared between the driver and the transactions it hands out
pub(crate) struct PoolShared {
    location: String,
    config: SqliteDriverConfig,
    idle: Mutex<Vec<Arc<PooledSqlite>>>,
    open: Mutex<HashMap<u64, Instant>>,
}

impl PoolShared {
    fn checkout(&self) -> Result<Arc<PooledSqlite>> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        tracing::debug!(location = %self.location, "opening new SQLite connection");
        Ok(Arc::new(PooledSqlite::open(&self.location, &self.config)?))
    }

    /// Hand a connection back after its transaction ended
    pub(crate) fn release(&self, id: u64, conn: Arc<PooledSqlite>, reusable: bool) {
        self.open.lock().remove(&id);
        if reusable {
            self.idle.lock().push(conn);
        }
    }
}

/// SQLite implementation of [`TransactionDriver`]
pub struct SqliteDriver {
    shared: Arc<PoolShared>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl SqliteDriver {
    /// Open a driver for the configured database.
    ///
    /// One connection is opened eagerly so that a bad path fails here rather
    /// than on the first transaction.
    pub fn open(config: SqliteDriverConfig) -> Result<Self> {
        let location = Self::resolve_location(config.path())?;
        tracing::info!(location = %location, max_connections = config.max_connections(), "opening SQLite driver");

        let first = PooledSqlite::open(&location, &config)?;
        let semaphore = Arc::new(Semaphore::new(config.max_connections()));
        let shared = Arc::new(PoolShared {
            location,
            config,
            idle: Mutex::new(vec![Arc::new(first)]),
            open: Mutex::new(HashMap::new()),
        });

        Ok(Self {
            shared,
            semaphore,
            next_id: AtomicU64::new(1),
        })
    }

    /// `:memory:` would give every connection its own database, so it is
    /// mapped to a uniquely named shared-cache database instead
    fn resolve_location(path: &str) -> Result<String> {
        if path == ":memory:" {
            return Ok(format!(
                "file:txguard-{}?mode=memory&cache=shared",
                uuid::Uuid::new_v4()
            ));
        }
        if !path.starts_with("file:") {
            let file_path = std::path::Path::new(path);
            if let Some(parent) = file_path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                return Err(TxGuardError::Configuration(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        Ok(path.to_string())
    }

    /// Run a script outside of any managed transaction (schema setup, seeding)
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TxGuardError::Connection("Connection pool closed".into()))?;
        let conn = self.shared.checkout()?;
        let sql = sql.to_string();
        let task_conn = conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let guard = task_conn.conn.lock();
            guard
                .execute_batch(&sql)
                .map_err(|e| TxGuardError::Statement(format!("Script failed: {}", e)))
        })
        .await
        .map_err(|e| TxGuardError::Statement(format!("Script task failed: {}", e)))?;

        self.shared.idle.lock().push(conn);
        result
    }

    /// Get the driver configuration
    pub fn config(&self) -> &SqliteDriverConfig {
        &self.shared.config
    }
}

#[async_trait]
impl TransactionDriver for SqliteDriver {
    fn driver_name(&self) -> &str {
        "sqlite"
    }

    async fn begin_transaction(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn DriverTransaction>> {
        let acquire_timeout = self.shared.config.acquire_timeout();
        let permit = tokio::time::timeout(acquire_timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| {
                TxGuardError::Connection(format!(
                    "Timed out waiting for connection (timeout: {:?})",
                    acquire_timeout
                ))
            })?
            .map_err(|_| TxGuardError::Connection("Connection pool closed".into()))?;

        let conn = self.shared.checkout()?;
        let begin_conn = conn.clone();
        tokio::task::spawn_blocking(move || begin_conn.begin())
            .await
            .map_err(|e| TxGuardError::Connection(format!("Begin task failed: {}", e)))??;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.open.lock().insert(id, Instant::now());
        tracing::debug!(transaction = id, timeout = ?timeout, "SQLite transaction started");

        Ok(Box::new(SqliteTransaction::new(
            id,
            conn,
            self.shared.clone(),
            permit,
            timeout,
        )))
    }

    fn list_open_transactions(&self) -> usize {
        self.shared.open.lock().len()
    }
}
