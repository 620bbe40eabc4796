//! Error types for the custody ledger

use crate::types::{Address, BatchId, ViolationId};
use thiserror::Error;

/// Result type for custody operations
pub type Result<T> = std::result::Result<T, Error>;

/// Custody ledger errors
///
/// The first group is the command taxonomy callers are expected to match on.
/// Every command that fails with one of these leaves the committed state
/// untouched. The second group covers the infrastructure around the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller lacks the role or capability the command needs
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Non-positive quantity, malformed address, bad id, or a rejected policy value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transfer exceeds owned stock or the batch remainder
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Quantity the command asked to move
        requested: u64,
        /// Quantity actually available at the source
        available: u64,
    },

    /// Source account is blacklisted
    #[error("Holder {0} is blacklisted")]
    Blacklisted(Address),

    /// Manual blacklist of an address that is already blacklisted
    #[error("Holder {0} is already blacklisted")]
    AlreadyBlacklisted(Address),

    /// Blacklist removal for an address that is not blacklisted
    #[error("Holder {0} is not blacklisted")]
    NotBlacklisted(Address),

    /// Unknown batch id
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Unknown violation id
    #[error("Violation not found: {0}")]
    ViolationNotFound(ViolationId),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invariant violation (balance conservation, counters, ...)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for `NotFound`-class errors (unknown batch or violation id)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::BatchNotFound(_) | Error::ViolationNotFound(_))
    }

    /// Short stable label, used as a metrics dimension
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "unauthorized",
            Error::InvalidInput(_) => "invalid_input",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::Blacklisted(_) => "blacklisted",
            Error::AlreadyBlacklisted(_) => "already_blacklisted",
            Error::NotBlacklisted(_) => "not_blacklisted",
            Error::BatchNotFound(_) | Error::ViolationNotFound(_) => "not_found",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::InvariantViolation(_) => "invariant",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
