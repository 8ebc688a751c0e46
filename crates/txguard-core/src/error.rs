//! Error types for txguard

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type for txguard operations
#[derive(Error, Debug)]
pub enum TxGuardError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Statement error: {0}")]
    Statement(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Commit error: {0}")]
    Commit(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TxGuardError {
    /// Classify this error for reporting and policy decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::Configuration(_) | Self::Serialization(_) => {
                ErrorKind::InvalidArgument
            }
            Self::Connection(_) | Self::Io(_) => ErrorKind::ConnectionError,
            Self::Statement(_) => ErrorKind::StatementError,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Commit(_) => ErrorKind::CommitError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InternalConsistency(_) => ErrorKind::InternalConsistency,
        }
    }

    /// Whether this failure was caused by the broadcast or caller cancellation
    /// rather than by the partition itself
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Coarse classification of a [`TxGuardError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Caller error, detected before any transaction is opened
    InvalidArgument,
    /// The driver could not allocate a transaction
    ConnectionError,
    /// A statement failed inside a transaction
    StatementError,
    /// A transaction ran past its deadline
    DeadlineExceeded,
    /// The driver refused to commit
    CommitError,
    /// Work was abandoned because of a cancellation signal
    Cancelled,
    /// A transaction handle outlived the call that opened it
    InternalConsistency,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid_argument",
            Self::ConnectionError => "connection_error",
            Self::StatementError => "statement_error",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::CommitError => "commit_error",
            Self::Cancelled => "cancelled",
            Self::InternalConsistency => "internal_consistency",
        };
        f.write_str(name)
    }
}

/// Result type alias for txguard operations
pub type Result<T> = std::result::Result<T, TxGuardError>;
