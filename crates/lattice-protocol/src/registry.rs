//! Node registry: who may sign what, and which nodes a target reaches.
//!
//! The registry is supplied once at startup and never mutated during
//! dispatch. It holds three disjoint principal sets:
//! - nodes: addressable processing units with capability tags
//! - callers: external origins allowed to submit directives
//! - validators: keys authorized to decide pending ledger entries
//!
//! Nodes may also act as directive origins, since cross-node traffic is
//! routed back through the coordinator as ordinary directives.

use ed25519_dalek::VerifyingKey;
use std::collections::{BTreeMap, BTreeSet};

use crate::action::Target;

/// A registered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: String,
    pub public_key: VerifyingKey,
    pub capabilities: BTreeSet<String>,
}

impl NodeRecord {
    pub fn new<I, S>(id: impl Into<String>, public_key: VerifyingKey, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            public_key,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    nodes: BTreeMap<String, NodeRecord>,
    callers: BTreeMap<String, VerifyingKey>,
    validators: BTreeMap<String, VerifyingKey>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_node(mut self, record: NodeRecord) -> Self {
        self.nodes.insert(record.id.clone(), record);
        self
    }

    #[must_use]
    pub fn with_caller(mut self, id: impl Into<String>, key: VerifyingKey) -> Self {
        self.callers.insert(id.into(), key);
        self
    }

    #[must_use]
    pub fn with_validator(mut self, id: impl Into<String>, key: VerifyingKey) -> Self {
        self.validators.insert(id.into(), key);
        self
    }

    /// Key for a directive origin: a caller first, then a node.
    pub fn origin_key(&self, origin: &str) -> Option<&VerifyingKey> {
        self.callers
            .get(origin)
            .or_else(|| self.nodes.get(origin).map(|n| &n.public_key))
    }

    pub fn validator_key(&self, id: &str) -> Option<&VerifyingKey> {
        self.validators.get(id)
    }

    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every principal allowed to originate directives.
    pub fn origins(&self) -> impl Iterator<Item = &str> {
        self.callers
            .keys()
            .chain(self.nodes.keys())
            .map(String::as_str)
    }

    /// Resolve a target to node ids, sorted. Unknown nodes and unmatched
    /// capability tags resolve to nothing.
    pub fn resolve(&self, target: &Target) -> Vec<String> {
        match target {
            Target::Node(id) => self
                .nodes
                .get(id)
                .map(|n| vec![n.id.clone()])
                .unwrap_or_default(),
            Target::Broadcast => self.nodes.keys().cloned().collect(),
            Target::Capability(tag) => self
                .nodes
                .values()
                .filter(|n| n.has_capability(tag))
                .map(|n| n.id.clone())
                .collect(),
        }
    }
}

/// Parse a hex-encoded Ed25519 public key.
pub fn parse_verifying_key(text: &str) -> Result<VerifyingKey, String> {
    let raw = hex::decode(text.trim()).map_err(|e| format!("invalid hex: {e}"))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected 32 bytes, got {}", v.len()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| format!("invalid ed25519 key: {e}"))
}
