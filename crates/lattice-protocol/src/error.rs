//! Error types for lattice-protocol.

use thiserror::Error;

/// Result type for lattice-protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boundary errors. Each of these terminates a directive as REJECTED
/// before it reaches any node, except [`Error::StateUnavailable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Schema, encoding or clock-skew failure.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Bad signature or unknown origin.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Stale or duplicate sequence counter, or a nonce seen inside the
    /// retention window.
    #[error("replay detected: {0}")]
    ReplayDetected(String),

    /// The replay state could not be made durable, so the directive was
    /// not accepted.
    #[error("replay state unavailable: {0}")]
    StateUnavailable(String),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEnvelope(msg.into())
    }
}
