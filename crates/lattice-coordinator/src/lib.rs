//! Router and coordinator for the Lattice coordination core.
//!
//! Ties the pieces together: signed directives come in over HTTP, pass the
//! signature & nonce guard, fan out to per-node workers and come back as a
//! single signed response. Converged transitions land in the ledger; those
//! in the review band wait for a validator's signed decision.
//!
//! # Components
//!
//! - [`config`]: static TOML configuration
//! - [`router`]: admission, dispatch, aggregation, validation, teardown
//! - [`api`]: axum HTTP surface
//! - [`coordinator`]: process bootstrap

pub mod api;
pub mod config;
pub mod coordinator;
pub mod detail;
pub mod error;
pub mod router;
mod tracker;

pub use config::LatticeConfig;
pub use coordinator::{Coordinator, SIGNER_NAME};
pub use detail::{aggregate, Aggregate, LedgerLink, NodeDetail};
pub use error::{Error, Result};
pub use router::{DirectiveRouter, NodeView, RouterBuilder, DEFAULT_AUDIT_WINDOW, DEFAULT_DISPATCH_TIMEOUT};
