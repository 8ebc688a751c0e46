//! SQLite transaction driver
//!
//! Implements the txguard driver contract over a bounded set of rusqlite
//! connections. Every transaction owns one connection for its lifetime;
//! statements run on the blocking pool and can be interrupted from another
//! task, which is what makes forced rollback possible while a statement is
//! still executing.
//!
//! Connections register a `sleep(ms)` SQL function that honours interruption,
//! so long-running statements can be simulated without a real workload.

mod config;
mod convert;
mod driver;
mod transaction;

pub use config::SqliteDriverConfig;
pub use driver::SqliteDriver;
pub use transaction::SqliteTransaction;
