//! Signed responses returned to directive callers.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::codec::{hex_array, Encoder};
use crate::directive::SIGNATURE_LEN;
use crate::error::{Error, Result};

const DOMAIN: &str = "lattice.response.v1";

/// Outcome of a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failure,
    /// Only while a ledger entry awaits human validation.
    Pending,
    Rejected,
}

impl Status {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }

    const fn code(self) -> u8 {
        match self {
            Status::Success => 1,
            Status::Failure => 2,
            Status::Pending => 3,
            Status::Rejected => 4,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "SUCCESS",
            Status::Failure => "FAILURE",
            Status::Pending => "PENDING",
            Status::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Machine-readable reason attached to non-success outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    MalformedEnvelope,
    AuthFailure,
    ReplayDetected,
    NodeUnavailable,
    TransitionError,
    LedgerIntegrityError,
    AwaitingValidation,
    ValidationRejected,
    StateUnavailable,
}

impl ReasonCode {
    const fn code(self) -> u8 {
        match self {
            ReasonCode::MalformedEnvelope => 1,
            ReasonCode::AuthFailure => 2,
            ReasonCode::ReplayDetected => 3,
            ReasonCode::NodeUnavailable => 4,
            ReasonCode::TransitionError => 5,
            ReasonCode::LedgerIntegrityError => 6,
            ReasonCode::AwaitingValidation => 7,
            ReasonCode::ValidationRejected => 8,
            ReasonCode::StateUnavailable => 9,
        }
    }
}

impl From<&Error> for ReasonCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::MalformedEnvelope(_) => ReasonCode::MalformedEnvelope,
            Error::AuthFailure(_) => ReasonCode::AuthFailure,
            Error::ReplayDetected(_) => ReasonCode::ReplayDetected,
            Error::StateUnavailable(_) => ReasonCode::StateUnavailable,
        }
    }
}

/// Response fields covered by the signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Correlation id of the directive.
    pub id: Uuid,
    pub status: Status,
    pub reason_code: Option<ReasonCode>,
    /// Human-readable explanation.
    pub reason: String,
    pub result_payload: Value,
    pub timestamp: u64,
    /// Identity of the signing coordinator.
    pub signer: String,
}

impl ResponseBody {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new(DOMAIN);
        enc.put_fixed(self.id.as_bytes())
            .put_u8(self.status.code())
            .put_u8(self.reason_code.map_or(0, ReasonCode::code))
            .put_str(&self.reason)
            .put_str(&self.result_payload.to_string())
            .put_u64(self.timestamp)
            .put_str(&self.signer);
        enc.finish()
    }
}

/// A signed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(flatten)]
    body: ResponseBody,
    #[serde(with = "hex_array")]
    signature: [u8; SIGNATURE_LEN],
}

impl Response {
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn id(&self) -> Uuid {
        self.body.id
    }

    pub fn status(&self) -> Status {
        self.body.status
    }

    pub fn reason_code(&self) -> Option<ReasonCode> {
        self.body.reason_code
    }

    pub fn reason(&self) -> &str {
        &self.body.reason
    }

    pub fn result_payload(&self) -> &Value {
        &self.body.result_payload
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let signature = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.body.canonical_bytes(), &signature)
            .map_err(|_| Error::AuthFailure("response signature mismatch".into()))
    }
}

/// Signs responses on behalf of the coordinator.
#[derive(Clone)]
pub struct ResponseSigner {
    name: String,
    key: SigningKey,
}

impl ResponseSigner {
    pub fn new(name: impl Into<String>, key: SigningKey) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Build and sign a response stamped with the current time.
    pub fn sign(
        &self,
        id: Uuid,
        status: Status,
        reason_code: Option<ReasonCode>,
        reason: impl Into<String>,
        result_payload: Value,
    ) -> Response {
        let body = ResponseBody {
            id,
            status,
            reason_code,
            reason: reason.into(),
            result_payload,
            timestamp: crate::now_millis(),
            signer: self.name.clone(),
        };
        let signature = self.key.sign(&body.canonical_bytes()).to_bytes();
        Response { body, signature }
    }

    /// Terminal REJECTED response for a boundary error.
    pub fn reject(&self, id: Uuid, err: &Error) -> Response {
        self.sign(
            id,
            Status::Rejected,
            Some(ReasonCode::from(err)),
            err.to_string(),
            Value::Null,
        )
    }
}

impl fmt::Debug for ResponseSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSigner")
            .field("name", &self.name)
            .field("public_key", &hex::encode(self.key.verifying_key().as_bytes()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signer() -> ResponseSigner {
        ResponseSigner::new("coordinator", SigningKey::from_bytes(&[3; 32]))
    }

    #[test]
    fn signed_response_verifies() {
        let signer = signer();
        let response = signer.sign(Uuid::new_v4(), Status::Success, None, "ok", json!({"nodes": {}}));
        assert!(response.verify(&signer.verifying_key()).is_ok());
        assert!(response.status().is_terminal());
    }

    #[test]
    fn tampered_response_fails() {
        let signer = signer();
        let response = signer.sign(Uuid::new_v4(), Status::Failure, Some(ReasonCode::NodeUnavailable), "down", Value::Null);
        let mut value = serde_json::to_value(&response).unwrap();
        value["status"] = json!("SUCCESS");
        let forged: Response = serde_json::from_value(value).unwrap();
        assert!(forged.verify(&signer.verifying_key()).is_err());
    }

    #[test]
    fn rejection_carries_reason_code() {
        let err = Error::ReplayDetected("counter 1 already accepted".into());
        let response = signer().reject(Uuid::new_v4(), &err);
        assert_eq!(response.status(), Status::Rejected);
        assert_eq!(response.reason_code(), Some(ReasonCode::ReplayDetected));
        assert!(response.reason().contains("counter 1"));
    }

    #[test]
    fn pending_is_not_terminal() {
        assert!(!Status::Pending.is_terminal());
    }
}
