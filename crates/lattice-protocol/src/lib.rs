//! Lattice wire protocol.
//!
//! Signed envelopes exchanged with the coordination core, the static node
//! registry, and the signature & nonce guard that sits in front of every
//! node.
//!
//! # Envelopes
//!
//! - [`Directive`]: an instruction from an origin to one or more nodes
//! - [`Response`]: the coordinator's signed answer, correlated by id
//! - [`ValidationAction`]: a validator's decision on a pending ledger entry
//!
//! All three sign a canonical byte encoding (see [`codec`]) with Ed25519.

pub mod action;
pub mod codec;
pub mod directive;
pub mod error;
pub mod guard;
pub mod registry;
pub mod response;
pub mod validation;

pub use action::{Action, Target};
pub use directive::{Directive, DirectiveBody, SIGNATURE_LEN};
pub use error::{Error, Result};
pub use guard::{CounterStore, Guard, GuardConfig, MemoryCounterStore, StoreError};
pub use registry::{parse_verifying_key, NodeRecord, Registry};
pub use response::{ReasonCode, Response, ResponseBody, ResponseSigner, Status};
pub use validation::{Decision, ValidationAction, ValidationBody};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
