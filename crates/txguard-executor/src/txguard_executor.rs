//! Parallel transaction-guarded batch execution
//!
//! Runs one statement over a batch of parameter rows, split into partitions
//! that each execute inside their own transaction on their own task. However
//! the call ends (success, statement failure, timeout, caller cancellation or
//! the future being dropped) every transaction it opened is committed or
//! rolled back, so the driver's open-transaction count returns to where it
//! was before the call.
//!
//! # Example
//!
//! ```ignore
//! let executor = ParallelExecutor::new(
//!     driver,
//!     ParallelOptions::new().with_parallelism(8).with_transaction_timeout_ms(60_000),
//! );
//! let results = executor.execute(WorkItem::new("SELECT :a"), batch).await?;
//! ```

mod config;
mod executor;
mod guard;
mod handle;
mod monitor;
mod partition;
mod procedure;
mod result;
mod work;
mod worker;

pub use config::{ExecutorSettings, FailurePolicy, ParallelOptions, PartitionStrategy};
pub use executor::ParallelExecutor;
pub use guard::GuardState;
pub use handle::{HandleState, TransactionHandle, TransactionId};
pub use monitor::TimeoutMonitor;
pub use partition::{Partition, partition};
pub use procedure::{ParallelProcedure, ParallelRequest};
pub use result::{ExecutionResult, ExecutionSummary};
pub use work::WorkItem;
pub use worker::Worker;
