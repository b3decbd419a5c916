//! Node runtime for the Lattice coordination core.
//!
//! Each node owns one [`NodeState`] and advances it with a deterministic
//! [`StateModel`]. A [`NodeHandle`] runs the node as a single-writer worker:
//! transitions are prepared, scored and (when converged) committed to the
//! ledger, and only then installed.

pub mod error;
pub mod input;
pub mod model;
pub mod runtime;
pub mod worker;

pub use error::{NodeFailure, TransitionError, Unavailable};
pub use input::encode_input;
pub use model::{LinearRecurrence, StateModel, Step, DEFAULT_BOUND};
pub use runtime::{NodeRuntime, NodeState, Prepared};
pub use worker::{NodeHandle, NodeOutcome, DEFAULT_MAILBOX};
