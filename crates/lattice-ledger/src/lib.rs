//! Convergence ledger for the Lattice coordination core.
//!
//! An append-only, gapless, hash-chained record of node transitions that
//! converged. Entries either commit automatically or wait for a signed
//! human decision; decisions are stored beside the entry, never over it.

pub mod entry;
pub mod error;
pub mod ledger;
pub mod storage;

pub use entry::{
    state_hash, CommitRequest, DecisionRecord, EntryRecord, LedgerEntry, LedgerPage,
    ValidationStatus, GENESIS_HASH,
};
pub use error::{Error, Result};
pub use ledger::{ConvergenceLedger, MAX_PAGE};
pub use storage::Storage;
