//! Per-node results and their aggregation into one response.

use std::collections::BTreeMap;

use lattice_consensus::Convergence;
use lattice_ledger::{LedgerEntry, ValidationStatus};
use lattice_node::{NodeFailure, NodeOutcome};
use lattice_protocol::{ReasonCode, Status};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Ledger linkage of one node's transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerLink {
    pub sequence_number: u64,
    pub validation_status: ValidationStatus,
    pub entry_hash: String,
}

impl From<&LedgerEntry> for LedgerLink {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            sequence_number: entry.sequence_number(),
            validation_status: entry.validation_status,
            entry_hash: hex::encode(entry.record.entry_hash),
        }
    }
}

/// What one targeted node contributed to a directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetail {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    pub reason: String,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convergence: Option<Convergence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<LedgerLink>,
}

impl NodeDetail {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::failure(ReasonCode::NodeUnavailable, reason)
    }

    fn failure(code: ReasonCode, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            reason_code: Some(code),
            reason: reason.into(),
            result: Value::Null,
            version: None,
            convergence: None,
            ledger: None,
        }
    }

    pub fn from_outcome(outcome: NodeOutcome) -> Self {
        match outcome {
            NodeOutcome::Applied {
                version,
                output,
                convergence,
                entry,
            } => {
                let ledger = entry.as_ref().map(LedgerLink::from);
                let (status, reason_code, reason) = match &ledger {
                    Some(link) if link.validation_status.is_pending() => (
                        Status::Pending,
                        Some(ReasonCode::AwaitingValidation),
                        format!("ledger entry {} awaits validation", link.sequence_number),
                    ),
                    Some(link) => (
                        Status::Success,
                        None,
                        format!("applied, committed as ledger entry {}", link.sequence_number),
                    ),
                    None => (Status::Success, None, "applied".to_string()),
                };
                Self {
                    status,
                    reason_code,
                    reason,
                    result: json!({ "output": output }),
                    version: Some(version),
                    convergence: Some(convergence),
                    ledger,
                }
            }
            NodeOutcome::Observed(result) => Self {
                status: Status::Success,
                reason_code: None,
                reason: "observed".to_string(),
                version: result.get("version").and_then(Value::as_u64),
                result,
                convergence: None,
                ledger: None,
            },
            NodeOutcome::Failed(NodeFailure::Transition(e)) => {
                Self::failure(ReasonCode::TransitionError, e.to_string())
            }
            NodeOutcome::Failed(failure @ NodeFailure::Ledger(_)) => {
                Self::failure(ReasonCode::LedgerIntegrityError, failure.to_string())
            }
        }
    }

    /// Settle a pending detail after a validator decided its entry.
    pub(crate) fn settle(&mut self, status: ValidationStatus) {
        let Some(link) = self.ledger.as_mut() else {
            return;
        };
        link.validation_status = status;
        match status {
            ValidationStatus::Approved => {
                self.status = Status::Success;
                self.reason_code = None;
                self.reason = format!("ledger entry {} approved", link.sequence_number);
            }
            ValidationStatus::Rejected => {
                self.status = Status::Rejected;
                self.reason_code = Some(ReasonCode::ValidationRejected);
                self.reason = format!("ledger entry {} rejected by validator", link.sequence_number);
            }
            _ => {}
        }
    }

    /// Sequence number of the entry this detail waits on, if any.
    pub(crate) fn pending_sequence(&self) -> Option<u64> {
        match (&self.ledger, self.status) {
            (Some(link), Status::Pending) => Some(link.sequence_number),
            _ => None,
        }
    }
}

/// Overall outcome of a directive.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub status: Status,
    pub reason_code: Option<ReasonCode>,
    pub reason: String,
    pub payload: Value,
}

fn rank(status: Status) -> u8 {
    match status {
        Status::Failure => 3,
        Status::Rejected => 2,
        Status::Pending => 1,
        Status::Success => 0,
    }
}

/// Combine per-node details: FAILURE > REJECTED > PENDING > SUCCESS.
///
/// The reason code is that of the first node (by id) holding the winning
/// status. An empty map counts as unavailable.
pub fn aggregate(details: &BTreeMap<String, NodeDetail>) -> Aggregate {
    let payload = json!({ "nodes": details });
    let Some(status) = details.values().map(|d| d.status).max_by_key(|s| rank(*s)) else {
        return Aggregate {
            status: Status::Failure,
            reason_code: Some(ReasonCode::NodeUnavailable),
            reason: "target resolves to no registered node".to_string(),
            payload,
        };
    };

    let deciding: Vec<(&String, &NodeDetail)> = details.iter().filter(|(_, d)| d.status == status).collect();
    let reason_code = deciding.iter().find_map(|(_, d)| d.reason_code);
    let reason = if status == Status::Success {
        format!("{} of {} node(s) succeeded", deciding.len(), details.len())
    } else {
        deciding
            .iter()
            .map(|(id, d)| format!("{id}: {}", d.reason))
            .collect::<Vec<_>>()
            .join("; ")
    };

    Aggregate {
        status,
        reason_code,
        reason,
        payload,
    }
}
