//! Ledger entry types and the hash chain.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use lattice_consensus::Convergence;
use lattice_protocol::codec::{hex_array, Encoder};
use lattice_protocol::{Decision, ValidationAction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

const ENTRY_DOMAIN: &str = "lattice.ledger.entry.v1";

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: [u8; 32] = [0; 32];

/// BLAKE3 content hash of a state vector (little-endian f64 components).
pub fn state_hash(state: &[f64]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(state.len() as u64).to_le_bytes());
    for x in state {
        hasher.update(&x.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// Short hex prefix for log lines.
pub(crate) fn short(hash: &[u8; 32]) -> String {
    hex::encode(&hash[..4])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    AutoCommitted,
    PendingHuman,
    Approved,
    Rejected,
}

impl ValidationStatus {
    pub const fn is_pending(self) -> bool {
        matches!(self, ValidationStatus::PendingHuman)
    }
}

/// What a node hands the ledger for one converged transition.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    pub node_id: &'a str,
    pub directive_id: Uuid,
    pub prior_version: u64,
    pub new_version: u64,
    pub state: &'a [f64],
}

/// The immutable, signed part of a ledger entry as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub sequence_number: u64,
    pub node_id: String,
    pub directive_id: Uuid,
    pub prior_version: u64,
    pub new_version: u64,
    pub convergence_score: f64,
    pub requires_validation: bool,
    #[serde(with = "hex_array")]
    pub state_hash: [u8; 32],
    #[serde(with = "hex_array")]
    pub prev_hash: [u8; 32],
    #[serde(with = "hex_array")]
    pub entry_hash: [u8; 32],
    #[serde(with = "hex_array")]
    pub signature: [u8; 64],
    /// Unix time in milliseconds.
    pub committed_at: u64,
}

impl EntryRecord {
    /// Build and seal the next entry in the chain.
    pub(crate) fn seal(
        sequence_number: u64,
        prev_hash: [u8; 32],
        request: &CommitRequest<'_>,
        convergence: &Convergence,
        committed_at: u64,
        key: &SigningKey,
    ) -> Self {
        let mut record = Self {
            sequence_number,
            node_id: request.node_id.to_string(),
            directive_id: request.directive_id,
            prior_version: request.prior_version,
            new_version: request.new_version,
            convergence_score: convergence.score,
            requires_validation: !matches!(
                convergence.decision,
                lattice_consensus::ConvergenceDecision::AutoCommit
            ),
            state_hash: state_hash(request.state),
            prev_hash,
            entry_hash: [0; 32],
            signature: [0; 64],
            committed_at,
        };
        record.entry_hash = record.compute_hash();
        record.signature = key.sign(&record.entry_hash).to_bytes();
        record
    }

    /// Hash over every field except `entry_hash` and `signature`.
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut enc = Encoder::new(ENTRY_DOMAIN);
        enc.put_u64(self.sequence_number)
            .put_str(&self.node_id)
            .put_fixed(self.directive_id.as_bytes())
            .put_u64(self.prior_version)
            .put_u64(self.new_version)
            .put_u64(self.convergence_score.to_bits())
            .put_u8(u8::from(self.requires_validation))
            .put_fixed(&self.state_hash)
            .put_fixed(&self.prev_hash)
            .put_u64(self.committed_at);
        *blake3::hash(&enc.finish()).as_bytes()
    }

    /// Check the entry's own hash and the coordinator signature over it.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        if self.compute_hash() != self.entry_hash {
            return Err(Error::Integrity(format!(
                "entry {} hash mismatch",
                self.sequence_number
            )));
        }
        let signature = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.entry_hash, &signature).map_err(|_| {
            Error::Integrity(format!("entry {} signature invalid", self.sequence_number))
        })
    }
}

/// A validator's decision, stored beside the entry it decides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub sequence_number: u64,
    pub action: ValidationAction,
    pub decided_at: u64,
}

/// An entry as served to readers: the stored record plus its derived
/// validation status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub record: EntryRecord,
    pub validation_status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionRecord>,
}

impl LedgerEntry {
    pub(crate) fn assemble(record: EntryRecord, decision: Option<DecisionRecord>) -> Result<Self> {
        let validation_status = match (&decision, record.requires_validation) {
            (None, false) => ValidationStatus::AutoCommitted,
            (None, true) => ValidationStatus::PendingHuman,
            (Some(d), true) => match d.action.decision() {
                Decision::Approve => ValidationStatus::Approved,
                Decision::Reject => ValidationStatus::Rejected,
            },
            (Some(_), false) => {
                return Err(Error::Integrity(format!(
                    "decision recorded for auto-committed entry {}",
                    record.sequence_number
                )))
            }
        };
        if let Some(d) = &decision {
            if d.sequence_number != record.sequence_number
                || d.action.sequence_number() != record.sequence_number
            {
                return Err(Error::Integrity(format!(
                    "decision stored under entry {} names a different entry",
                    record.sequence_number
                )));
            }
        }
        Ok(Self {
            record,
            validation_status,
            decision,
        })
    }

    pub fn sequence_number(&self) -> u64 {
        self.record.sequence_number
    }

    pub fn node_id(&self) -> &str {
        &self.record.node_id
    }
}

/// One page of the ordered export feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPage {
    pub entries: Vec<LedgerEntry>,
    /// Cursor for the following page, if more entries exist.
    pub next_after: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_consensus::ConvergenceDecision;

    fn sealed(seq: u64, prev: [u8; 32], decision: ConvergenceDecision) -> EntryRecord {
        let state = [0.25, -1.0, 3.0];
        let request = CommitRequest {
            node_id: "N1",
            directive_id: Uuid::nil(),
            prior_version: 1,
            new_version: 2,
            state: &state,
        };
        let convergence = Convergence {
            score: 0.95,
            decision,
        };
        EntryRecord::seal(seq, prev, &request, &convergence, 1_700_000_000_000, &SigningKey::from_bytes(&[7; 32]))
    }

    #[test]
    fn state_hash_is_deterministic_and_sensitive() {
        assert_eq!(state_hash(&[1.0, 2.0]), state_hash(&[1.0, 2.0]));
        assert_ne!(state_hash(&[1.0, 2.0]), state_hash(&[2.0, 1.0]));
        assert_ne!(state_hash(&[0.0]), state_hash(&[-0.0]));
    }

    #[test]
    fn sealed_entry_verifies() {
        let key = SigningKey::from_bytes(&[7; 32]).verifying_key();
        let record = sealed(1, GENESIS_HASH, ConvergenceDecision::AutoCommit);
        assert!(record.verify(&key).is_ok());
        assert!(!record.requires_validation);
    }

    #[test]
    fn edited_entry_fails_verification() {
        let key = SigningKey::from_bytes(&[7; 32]).verifying_key();
        let mut record = sealed(1, GENESIS_HASH, ConvergenceDecision::AutoCommit);
        record.convergence_score = 0.5;
        assert!(matches!(record.verify(&key), Err(Error::Integrity(_))));
    }

    #[test]
    fn status_derivation() {
        let auto = sealed(1, GENESIS_HASH, ConvergenceDecision::AutoCommit);
        let entry = LedgerEntry::assemble(auto, None).unwrap();
        assert_eq!(entry.validation_status, ValidationStatus::AutoCommitted);

        let pending = sealed(2, GENESIS_HASH, ConvergenceDecision::RequireHuman);
        let entry = LedgerEntry::assemble(pending.clone(), None).unwrap();
        assert!(entry.validation_status.is_pending());

        let action = lattice_protocol::ValidationBody::new(2, Decision::Reject, "auditor")
            .sign(&SigningKey::from_bytes(&[9; 32]));
        let decision = DecisionRecord {
            sequence_number: 2,
            action,
            decided_at: 0,
        };
        let entry = LedgerEntry::assemble(pending, Some(decision)).unwrap();
        assert_eq!(entry.validation_status, ValidationStatus::Rejected);
    }
}
