//! The signed directive envelope.
//!
//! A directive starts life as a [`DirectiveBody`] draft and becomes a
//! [`Directive`] only by signing. The signed form exposes no setters, so a
//! directive is immutable once signed; any change to the wire bytes breaks
//! either decoding or the signature.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::action::{Action, Target};
use crate::codec::{hex_array, Decoder, Encoder};
use crate::error::{Error, Result};

const DOMAIN: &str = "lattice.directive.v1";

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Every field of a directive except its signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveBody {
    pub id: Uuid,
    pub origin: String,
    pub target: Target,
    pub action: Action,
    pub payload: Value,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    #[serde(with = "hex_array")]
    pub nonce: [u8; 16],
    pub sequence_counter: u64,
}

impl DirectiveBody {
    /// Draft a directive with a fresh id, a random nonce and the current time.
    pub fn new(
        origin: impl Into<String>,
        target: Target,
        action: Action,
        payload: Value,
        sequence_counter: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            target,
            action,
            payload,
            timestamp: crate::now_millis(),
            nonce: rand::random(),
            sequence_counter,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: [u8; 16]) -> Self {
        self.nonce = nonce;
        self
    }

    /// Canonical bytes covered by the signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new(DOMAIN);
        enc.put_fixed(self.id.as_bytes())
            .put_str(&self.origin)
            .put_str(&self.target.to_string())
            .put_u8(self.action.code())
            .put_str(&self.payload.to_string())
            .put_u64(self.timestamp)
            .put_fixed(&self.nonce)
            .put_u64(self.sequence_counter);
        enc.finish()
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let id = Uuid::from_bytes(dec.read_fixed::<16>()?);
        let origin = dec.read_str()?.to_string();
        if origin.is_empty() {
            return Err(Error::malformed("empty origin"));
        }
        let target = dec.read_str()?.parse()?;
        let code = dec.read_u8()?;
        let action = Action::from_code(code)
            .ok_or_else(|| Error::malformed(format!("unknown action code {code}")))?;
        let payload = serde_json::from_str(dec.read_str()?)
            .map_err(|e| Error::malformed(format!("payload is not valid JSON: {e}")))?;
        let timestamp = dec.read_u64()?;
        let nonce = dec.read_fixed::<16>()?;
        let sequence_counter = dec.read_u64()?;
        Ok(Self {
            id,
            origin,
            target,
            action,
            payload,
            timestamp,
            nonce,
            sequence_counter,
        })
    }

    /// Sign the draft, producing an immutable directive.
    pub fn sign(self, key: &SigningKey) -> Directive {
        let signature = key.sign(&self.canonical_bytes()).to_bytes();
        Directive {
            body: self,
            signature,
        }
    }
}

/// A signed directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    #[serde(flatten)]
    body: DirectiveBody,
    #[serde(with = "hex_array")]
    signature: [u8; SIGNATURE_LEN],
}

impl Directive {
    pub fn body(&self) -> &DirectiveBody {
        &self.body
    }

    pub fn id(&self) -> Uuid {
        self.body.id
    }

    pub fn origin(&self) -> &str {
        &self.body.origin
    }

    pub fn target(&self) -> &Target {
        &self.body.target
    }

    pub fn action(&self) -> Action {
        self.body.action
    }

    pub fn payload(&self) -> &Value {
        &self.body.payload
    }

    pub fn timestamp(&self) -> u64 {
        self.body.timestamp
    }

    pub fn nonce(&self) -> &[u8; 16] {
        &self.body.nonce
    }

    pub fn sequence_counter(&self) -> u64 {
        self.body.sequence_counter
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    /// Check the signature against the origin's public key.
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<()> {
        let signature = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.body.canonical_bytes(), &signature)
            .map_err(|_| {
                Error::AuthFailure(format!(
                    "signature does not match origin {}",
                    self.body.origin
                ))
            })
    }

    /// Wire form: canonical bytes followed by the signature.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = self.body.canonical_bytes();
        wire.extend_from_slice(&self.signature);
        wire
    }

    /// Strict inverse of [`Directive::to_wire`].
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes, DOMAIN)?;
        let body = DirectiveBody::decode(&mut dec)?;
        let consumed = dec.position();
        let signature: [u8; SIGNATURE_LEN] = dec
            .rest()
            .try_into()
            .map_err(|_| Error::malformed("signature must be exactly 64 trailing bytes"))?;
        if body.canonical_bytes() != bytes[..consumed] {
            return Err(Error::malformed("envelope is not in canonical form"));
        }
        Ok(Self { body, signature })
    }

    /// BLAKE3 digest of the wire form. Identical resubmissions share it.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.to_wire()).as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn sample(seq: u64) -> Directive {
        DirectiveBody::new(
            "UI-A",
            Target::node("N1"),
            Action::Analyze,
            json!({"text": "bioload assessment", "weights": [0.5, 1.5], "nested": {"b": 1, "a": null}}),
            seq,
        )
        .sign(&key(1))
    }

    #[test]
    fn sign_then_verify() {
        let directive = sample(1);
        assert!(directive.verify_signature(&key(1).verifying_key()).is_ok());
    }

    #[test]
    fn wrong_key_fails() {
        let directive = sample(1);
        let err = directive.verify_signature(&key(2).verifying_key()).unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
    }

    #[test]
    fn wire_roundtrip_preserves_directive() {
        let directive = sample(9);
        let decoded = Directive::from_wire(&directive.to_wire()).unwrap();
        assert_eq!(decoded, directive);
        assert!(decoded.verify_signature(&key(1).verifying_key()).is_ok());
    }

    #[test]
    fn json_roundtrip_still_verifies() {
        let directive = sample(3);
        let json = serde_json::to_string(&directive).unwrap();
        let parsed: Directive = serde_json::from_str(&json).unwrap();
        assert!(parsed.verify_signature(&key(1).verifying_key()).is_ok());
        assert_eq!(parsed.digest(), directive.digest());
    }

    #[test]
    fn changed_field_after_json_edit_fails() {
        let directive = sample(3);
        let mut value = serde_json::to_value(&directive).unwrap();
        value["sequence_counter"] = json!(4);
        let edited: Directive = serde_json::from_value(value).unwrap();
        assert!(edited.verify_signature(&key(1).verifying_key()).is_err());
    }

    #[test]
    fn trailing_garbage_is_malformed() {
        let mut wire = sample(1).to_wire();
        wire.push(0);
        assert!(matches!(
            Directive::from_wire(&wire),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    proptest! {
        #[test]
        fn signed_directives_verify(
            origin in "[a-zA-Z0-9-]{1,16}",
            text in ".{0,64}",
            seq in any::<u64>(),
        ) {
            let signer = key(5);
            let directive = DirectiveBody::new(origin, Target::Broadcast, Action::Generate, json!({"text": text}), seq)
                .sign(&signer);
            prop_assert!(directive.verify_signature(&signer.verifying_key()).is_ok());
        }

        #[test]
        fn any_byte_mutation_is_detected(index in any::<prop::sample::Index>(), flip in 1u8..=255) {
            let signer = key(1);
            let directive = sample(11);
            let mut wire = directive.to_wire();
            let i = index.index(wire.len());
            wire[i] ^= flip;
            let accepted = Directive::from_wire(&wire)
                .and_then(|d| d.verify_signature(&signer.verifying_key()));
            prop_assert!(accepted.is_err());
        }
    }
}
