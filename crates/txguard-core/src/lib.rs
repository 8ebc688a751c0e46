//! txguard Core - shared abstractions for the parallel transaction executor
//!
//! This crate provides the types and traits that the executor and every
//! driver depend on. It defines:
//!
//! - `TransactionDriver` - trait for hosts that hand out transactions
//! - `DriverTransaction` - trait for a single open transaction
//! - `TxGuardError` / `ErrorKind` - the error surface of the whole workspace
//! - Common types like `Value`, `Row` and `ParameterRow`

mod driver;
mod error;
mod types;

pub use driver::*;
pub use error::*;
pub use types::*;
