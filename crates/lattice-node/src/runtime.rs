//! Node runtime: one node's state and the transitions applied to it.
//!
//! Transitions are two-phase. [`NodeRuntime::prepare`] computes the next
//! state without touching the current one; [`NodeRuntime::install`] makes
//! it current. Anything that must happen before a transition becomes
//! visible (the ledger commit) runs between the two, and a failure there
//! simply drops the prepared step.

use std::sync::Arc;

use lattice_consensus::dispersion;
use lattice_ledger::state_hash;
use lattice_protocol::Action;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TransitionError;
use crate::input::encode_input;
use crate::model::{check_dims, StateModel};

/// Per-node persistent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub state_vector: Vec<f64>,
    /// Starts at 1, incremented by exactly one per transition.
    pub version: u64,
    /// Unix millis of the last committed transition (bootstrap time before
    /// the first).
    pub last_updated: u64,
}

/// A computed but not yet installed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub prior_version: u64,
    pub next_state: Vec<f64>,
    pub output: Vec<f64>,
}

impl Prepared {
    pub fn new_version(&self) -> u64 {
        self.prior_version + 1
    }
}

pub struct NodeRuntime {
    state: NodeState,
    model: Arc<dyn StateModel>,
}

impl NodeRuntime {
    /// Create a node at version 1 with a zero state or `initial`.
    pub fn bootstrap(
        node_id: impl Into<String>,
        model: Arc<dyn StateModel>,
        initial: Option<Vec<f64>>,
    ) -> Result<Self, TransitionError> {
        let state_vector = initial.unwrap_or_else(|| vec![0.0; model.state_dim()]);
        check_dims("initial state", model.state_dim(), &state_vector)?;
        Ok(Self {
            state: NodeState {
                node_id: node_id.into(),
                state_vector,
                version: 1,
                last_updated: lattice_protocol::now_millis(),
            },
            model,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.state.node_id
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Compute the transition for a mutating action. Pure.
    pub fn prepare(&self, action: Action, payload: &Value) -> Result<Prepared, TransitionError> {
        let input = encode_input(action, payload, self.model.input_dim())?;
        let step = self.model.step(&self.state.state_vector, &input)?;
        check_dims("next state", self.model.state_dim(), &step.next_state)?;
        if step.output.iter().any(|x| !x.is_finite()) {
            return Err(TransitionError::NonFinite("output"));
        }
        Ok(Prepared {
            prior_version: self.state.version,
            next_state: step.next_state,
            output: step.output,
        })
    }

    /// Make a prepared transition current. Returns the new version.
    ///
    /// A step prepared against an older version is ignored.
    pub fn install(&mut self, prepared: Prepared, committed_at: u64) -> u64 {
        if prepared.prior_version != self.state.version {
            return self.state.version;
        }
        self.state.state_vector = prepared.next_state;
        self.state.version += 1;
        self.state.last_updated = committed_at;
        self.state.version
    }

    /// Prepare and install in one go, with no commit in between.
    pub fn apply(&mut self, action: Action, payload: &Value) -> Result<(Value, Vec<f64>), TransitionError> {
        let prepared = self.prepare(action, payload)?;
        let result = json!({ "output": prepared.output, "version": prepared.new_version() });
        let next_state = prepared.next_state.clone();
        self.install(prepared, lattice_protocol::now_millis());
        Ok((result, next_state))
    }

    /// Answer a read-only action.
    pub fn observe(&self, action: Action) -> Value {
        match action {
            Action::Snapshot => json!({
                "node_id": self.state.node_id,
                "version": self.state.version,
                "last_updated": self.state.last_updated,
                "state_vector": self.state.state_vector,
                "state_hash": hex::encode(state_hash(&self.state.state_vector)),
            }),
            _ => json!({
                "node_id": self.state.node_id,
                "version": self.state.version,
                "last_updated": self.state.last_updated,
                "dispersion": dispersion(&self.state.state_vector),
            }),
        }
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
