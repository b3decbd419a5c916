//! Error types for the convergence ledger.

use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sequence gap, hash mismatch or bad entry signature found on read.
    #[error("Ledger integrity error: {0}")]
    Integrity(String),

    /// Commits and decisions are refused until an operator intervenes.
    #[error("Ledger halted: {0}")]
    Halted(String),

    #[error("No ledger entry with sequence number {0}")]
    NotFound(u64),

    #[error("Unknown validator: {0}")]
    UnknownValidator(String),

    #[error("Invalid validation signature: {0}")]
    InvalidSignature(String),

    /// The entry was auto-committed and takes no decision.
    #[error("Ledger entry {0} is not awaiting validation")]
    NotPending(u64),

    #[error("Ledger entry {0} has already been decided")]
    AlreadyDecided(u64),
}

impl Error {
    /// Whether the error reflects a broken append-only invariant.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity(_) | Error::Halted(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
