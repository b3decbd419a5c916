//! Signed human validation actions for pending ledger entries.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::codec::{hex_array, Encoder};
use crate::directive::SIGNATURE_LEN;
use crate::error::{Error, Result};

const DOMAIN: &str = "lattice.validation.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    const fn code(self) -> u8 {
        match self {
            Decision::Approve => 1,
            Decision::Reject => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationBody {
    pub sequence_number: u64,
    pub decision: Decision,
    /// Registered validator id.
    pub validator: String,
    pub timestamp: u64,
}

impl ValidationBody {
    pub fn new(sequence_number: u64, decision: Decision, validator: impl Into<String>) -> Self {
        Self {
            sequence_number,
            decision,
            validator: validator.into(),
            timestamp: crate::now_millis(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new(DOMAIN);
        enc.put_u64(self.sequence_number)
            .put_u8(self.decision.code())
            .put_str(&self.validator)
            .put_u64(self.timestamp);
        enc.finish()
    }

    pub fn sign(self, key: &SigningKey) -> ValidationAction {
        let signature = key.sign(&self.canonical_bytes()).to_bytes();
        ValidationAction {
            body: self,
            signature,
        }
    }
}

/// `(sequence_number, decision)` signed by a validator key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationAction {
    #[serde(flatten)]
    body: ValidationBody,
    #[serde(with = "hex_array")]
    signature: [u8; SIGNATURE_LEN],
}

impl ValidationAction {
    pub fn body(&self) -> &ValidationBody {
        &self.body
    }

    pub fn sequence_number(&self) -> u64 {
        self.body.sequence_number
    }

    pub fn decision(&self) -> Decision {
        self.body.decision
    }

    pub fn validator(&self) -> &str {
        &self.body.validator
    }

    pub fn signature_hex(&self) -> String {
        hex::encode(self.signature)
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let signature = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.body.canonical_bytes(), &signature)
            .map_err(|_| {
                Error::AuthFailure(format!(
                    "validation signature does not match validator {}",
                    self.body.validator
                ))
            })
    }
}
