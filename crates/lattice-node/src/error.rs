//! Error types for the node runtime.

use thiserror::Error;

/// The state-update function refused a transition. State is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{what} has dimension {got}, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

/// Why a node could not complete a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeFailure {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The ledger refused the commit; the transition was not installed.
    #[error("ledger commit failed: {0}")]
    Ledger(String),
}

/// The node could not take the job at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Unavailable {
    #[error("node mailbox is full")]
    MailboxFull,

    #[error("node worker has stopped")]
    Stopped,
}
