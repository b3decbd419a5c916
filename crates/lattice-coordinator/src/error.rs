//! Error types for the coordinator.

use thiserror::Error;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad or inconsistent startup configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] lattice_ledger::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] lattice_protocol::Error),

    /// A node could not be bootstrapped
    #[error("Node error: {0}")]
    Node(#[from] lattice_node::TransitionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<lattice_consensus::ThresholdError> for Error {
    fn from(e: lattice_consensus::ThresholdError) -> Self {
        Error::Config(e.to_string())
    }
}
