//! The convergence ledger.
//!
//! # Commit protocol
//!
//! A commit takes the commit lock, seals the next entry against the current
//! tip, and writes entry, counter and tip in one RocksDB batch. The lock is a
//! plain mutex held across synchronous code only, so a commit that has begun
//! always runs to completion and sequence numbers are never skipped or
//! reused.
//!
//! # Integrity
//!
//! The chain is verified in full on open and entry by entry on every read.
//! Any violation halts the ledger: reads stay available, commits and
//! decisions are refused until an operator repairs the store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ed25519_dalek::{SigningKey, VerifyingKey};
use lattice_consensus::{Convergence, ConvergencePolicy};
use lattice_protocol::{Registry, ValidationAction};
use tracing::{debug, error, info, warn};

use crate::entry::{
    short, CommitRequest, DecisionRecord, EntryRecord, LedgerEntry, LedgerPage, GENESIS_HASH,
};
use crate::error::{Error, Result};
use crate::storage::Storage;

/// Largest page served by [`ConvergenceLedger::export`].
pub const MAX_PAGE: usize = 500;

#[derive(Debug)]
struct Chain {
    next_sequence: u64,
    tip: [u8; 32],
    halted: Option<String>,
}

pub struct ConvergenceLedger {
    storage: Arc<Storage>,
    policy: ConvergencePolicy,
    signer: SigningKey,
    registry: Arc<Registry>,
    chain: Mutex<Chain>,
}

impl ConvergenceLedger {
    /// Open the ledger, recovering the commit counter and verifying the
    /// stored chain before any new commit is accepted.
    pub fn open(
        storage: Arc<Storage>,
        policy: ConvergencePolicy,
        signer: SigningKey,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let next_sequence = storage.next_sequence()?.unwrap_or(1);
        let tip = storage.tip_hash()?.unwrap_or(GENESIS_HASH);

        let ledger = Self {
            storage,
            policy,
            signer,
            registry,
            chain: Mutex::new(Chain {
                next_sequence,
                tip,
                halted: None,
            }),
        };

        match ledger.walk_chain(next_sequence, tip) {
            Ok(count) => info!(
                entries = count,
                next_sequence,
                tip = %short(&tip),
                "ledger opened"
            ),
            Err(e) => {
                let mut chain = ledger.lock();
                ledger.halt_locked(&mut chain, e.to_string());
            }
        }

        Ok(ledger)
    }

    fn lock(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting commits and decisions. Reads remain available.
    pub fn halt(&self, reason: impl Into<String>) {
        self.halt_locked(&mut self.lock(), reason.into());
    }

    fn halt_locked(&self, chain: &mut Chain, reason: String) {
        if chain.halted.is_none() {
            error!(reason = %reason, "ledger halted: commits and decisions refused");
            chain.halted = Some(reason);
        }
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    /// Verify every entry below `next_sequence` and that the last hash is
    /// `tip`. Returns the number of entries checked.
    fn walk_chain(&self, next_sequence: u64, tip: [u8; 32]) -> Result<u64> {
        let key = self.verifying_key();
        let mut prev = GENESIS_HASH;
        let mut expected = 1u64;

        while expected < next_sequence {
            let batch = self.storage.entries_after(expected - 1, MAX_PAGE)?;
            if batch.is_empty() {
                return Err(Error::Integrity(format!(
                    "entry {expected} missing below commit counter {next_sequence}"
                )));
            }
            for record in batch {
                if record.sequence_number >= next_sequence {
                    return Err(Error::Integrity(format!(
                        "entry {} beyond commit counter {next_sequence}",
                        record.sequence_number
                    )));
                }
                check_link(&record, expected, &prev, &key)?;
                prev = record.entry_hash;
                expected += 1;
            }
        }

        if prev != tip {
            return Err(Error::Integrity(format!(
                "stored tip {} does not match chain head {}",
                short(&tip),
                short(&prev)
            )));
        }
        if self.storage.get_entry(next_sequence)?.is_some() {
            return Err(Error::Integrity(format!(
                "entry {next_sequence} exists at the commit counter"
            )));
        }
        Ok(expected - 1)
    }

    pub fn policy(&self) -> &ConvergencePolicy {
        &self.policy
    }

    /// Score a transition between two states of `node_id`.
    pub fn evaluate(&self, node_id: &str, prior: &[f64], next: &[f64]) -> Convergence {
        let convergence = self.policy.evaluate(prior, next);
        debug!(
            node = node_id,
            score = convergence.score,
            decision = ?convergence.decision,
            "convergence evaluated"
        );
        convergence
    }

    /// Append an entry for a converged transition. Returns `None` when the
    /// decision does not commit.
    pub fn commit(
        &self,
        request: CommitRequest<'_>,
        convergence: &Convergence,
    ) -> Result<Option<LedgerEntry>> {
        if !convergence.decision.commits() {
            return Ok(None);
        }

        let mut chain = self.lock();
        if let Some(reason) = &chain.halted {
            return Err(Error::Halted(reason.clone()));
        }

        let record = EntryRecord::seal(
            chain.next_sequence,
            chain.tip,
            &request,
            convergence,
            lattice_protocol::now_millis(),
            &self.signer,
        );
        self.storage.append_entry(&record)?;
        chain.next_sequence = record.sequence_number + 1;
        chain.tip = record.entry_hash;
        drop(chain);

        info!(
            sequence = record.sequence_number,
            node = %record.node_id,
            score = record.convergence_score,
            pending = record.requires_validation,
            hash = %short(&record.entry_hash),
            "ledger entry committed"
        );
        LedgerEntry::assemble(record, None).map(Some)
    }

    /// Apply a validator's decision to a pending entry. Each entry accepts
    /// exactly one decision.
    pub fn decide(&self, action: &ValidationAction) -> Result<LedgerEntry> {
        let validator = action.validator();
        let key = self
            .registry
            .validator_key(validator)
            .ok_or_else(|| Error::UnknownValidator(validator.to_string()))?;
        action.verify(key).map_err(|e| {
            warn!(validator, sequence = action.sequence_number(), "validation signature rejected");
            Error::InvalidSignature(e.to_string())
        })?;

        let seq = action.sequence_number();
        let mut chain = self.lock();
        if let Some(reason) = &chain.halted {
            return Err(Error::Halted(reason.clone()));
        }

        let record = self.load_verified(&mut chain, seq)?;
        if !record.requires_validation {
            return Err(Error::NotPending(seq));
        }
        if self.storage.get_decision(seq)?.is_some() {
            return Err(Error::AlreadyDecided(seq));
        }

        let decision = DecisionRecord {
            sequence_number: seq,
            action: action.clone(),
            decided_at: lattice_protocol::now_millis(),
        };
        self.storage.put_decision(&decision)?;
        drop(chain);

        info!(
            sequence = seq,
            validator,
            decision = ?action.decision(),
            "ledger entry decided"
        );
        LedgerEntry::assemble(record, Some(decision))
    }

    /// Load one entry, checking its hash, signature and link to its
    /// predecessor. A failed check halts the ledger.
    fn load_verified(&self, chain: &mut Chain, seq: u64) -> Result<EntryRecord> {
        if seq == 0 || seq >= chain.next_sequence {
            return Err(Error::NotFound(seq));
        }
        let result = self.storage.get_entry(seq).and_then(|record| {
            let record = record.ok_or_else(|| {
                Error::Integrity(format!("entry {seq} missing below commit counter"))
            })?;
            let prev = if seq == 1 {
                GENESIS_HASH
            } else {
                self.storage
                    .get_entry(seq - 1)?
                    .ok_or_else(|| Error::Integrity(format!("entry {} missing", seq - 1)))?
                    .entry_hash
            };
            check_link(&record, seq, &prev, &self.verifying_key())?;
            Ok(record)
        });
        if let Err(e) = &result {
            if e.is_integrity() {
                self.halt_locked(chain, e.to_string());
            }
        }
        result
    }

    /// A single entry with its current validation status.
    pub fn entry(&self, seq: u64) -> Result<Option<LedgerEntry>> {
        let mut chain = self.lock();
        let record = match self.load_verified(&mut chain, seq) {
            Ok(record) => record,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        drop(chain);
        let decision = self.storage.get_decision(seq)?;
        self.assemble_checked(record, decision).map(Some)
    }

    /// Entries strictly after `after`, in sequence order.
    pub fn export(&self, after: u64, limit: usize) -> Result<LedgerPage> {
        let limit = limit.clamp(1, MAX_PAGE);
        let (next_sequence, key) = {
            let chain = self.lock();
            (chain.next_sequence, self.verifying_key())
        };

        let mut prev = if after == 0 {
            GENESIS_HASH
        } else {
            match self.entry(after)? {
                Some(entry) => entry.record.entry_hash,
                None => {
                    return Ok(LedgerPage {
                        entries: Vec::new(),
                        next_after: None,
                    })
                }
            }
        };

        let mut entries = Vec::with_capacity(limit);
        let mut expected = after + 1;
        for record in self.storage.entries_after(after, limit)? {
            if record.sequence_number >= next_sequence {
                break;
            }
            if let Err(e) = check_link(&record, expected, &prev, &key) {
                self.halt(e.to_string());
                return Err(e);
            }
            prev = record.entry_hash;
            expected += 1;
            let decision = self.storage.get_decision(record.sequence_number)?;
            entries.push(self.assemble_checked(record, decision)?);
        }

        // A short page must reach the commit counter.
        if entries.len() < limit && expected < next_sequence {
            let e = Error::Integrity(format!("entry {expected} missing below commit counter"));
            self.halt(e.to_string());
            return Err(e);
        }

        let last = expected - 1;
        let next_after = (entries.len() == limit && last + 1 < next_sequence).then_some(last);
        Ok(LedgerPage {
            entries,
            next_after,
        })
    }

    fn assemble_checked(
        &self,
        record: EntryRecord,
        decision: Option<DecisionRecord>,
    ) -> Result<LedgerEntry> {
        if let Some(d) = &decision {
            let verified = self
                .registry
                .validator_key(d.action.validator())
                .map(|key| d.action.verify(key).is_ok())
                .unwrap_or(false);
            if !verified {
                let e = Error::Integrity(format!(
                    "decision on entry {} is not signed by a registered validator",
                    record.sequence_number
                ));
                self.halt(e.to_string());
                return Err(e);
            }
        }
        LedgerEntry::assemble(record, decision).inspect_err(|e| {
            if e.is_integrity() {
                self.halt(e.to_string());
            }
        })
    }

    /// Re-verify the whole chain. Halts the ledger on failure.
    pub fn verify_integrity(&self) -> Result<u64> {
        let mut chain = self.lock();
        match self.walk_chain(chain.next_sequence, chain.tip) {
            Ok(count) => Ok(count),
            Err(e) => {
                self.halt_locked(&mut chain, e.to_string());
                Err(e)
            }
        }
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.lock().halted.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted.is_some()
    }

    /// Sequence number the next commit will take.
    pub fn next_sequence(&self) -> u64 {
        self.lock().next_sequence
    }

    pub fn flush(&self) -> Result<()> {
        let _chain = self.lock();
        self.storage.flush()
    }
}

fn check_link(
    record: &EntryRecord,
    expected_seq: u64,
    prev: &[u8; 32],
    key: &VerifyingKey,
) -> Result<()> {
    if record.sequence_number != expected_seq {
        return Err(Error::Integrity(format!(
            "sequence gap: expected {expected_seq}, found {}",
            record.sequence_number
        )));
    }
    if &record.prev_hash != prev {
        return Err(Error::Integrity(format!(
            "entry {expected_seq} does not link to its predecessor"
        )));
    }
    record.verify(key)
}
