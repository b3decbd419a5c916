//! Static startup configuration.
//!
//! Loaded once from a TOML file and never changed while the coordinator
//! runs. `LATTICE_CONFIG` names the file (default `./lattice.toml`);
//! `LATTICE_DATA_DIR` and `LATTICE_API_ADDR` override the matching keys.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lattice_consensus::{
    ConvergencePolicy, ConvergenceThresholds, Metric, DEFAULT_AUTO_COMMIT, DEFAULT_REVIEW_FLOOR,
};
use lattice_node::DEFAULT_MAILBOX;
use lattice_protocol::{parse_verifying_key, GuardConfig, NodeRecord, Registry};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatticeConfig {
    /// Data directory for the ledger database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP API listen address
    #[serde(default = "default_api_addr")]
    pub api_addr: SocketAddr,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub guard: GuardSection,

    #[serde(default)]
    pub convergence: ConvergenceSection,

    #[serde(default)]
    pub nodes: Vec<NodeEntry>,

    /// Origins allowed to submit directives besides the nodes themselves
    #[serde(default)]
    pub callers: Vec<PrincipalEntry>,

    /// Keys allowed to decide pending ledger entries
    #[serde(default)]
    pub validators: Vec<PrincipalEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub state_dim: usize,
    pub input_dim: usize,
    pub output_dim: usize,
    /// Clamp bound of the recurrence
    pub bound: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            state_dim: 16,
            input_dim: 8,
            output_dim: 4,
            bound: lattice_node::DEFAULT_BOUND,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Per-node wait before a target counts as unavailable
    pub timeout_ms: u64,
    pub mailbox_capacity: usize,
    /// How long answered directives stay pollable
    pub audit_window_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            mailbox_capacity: DEFAULT_MAILBOX,
            audit_window_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardSection {
    pub clock_skew_secs: u64,
    pub nonce_retention_secs: u64,
    pub max_nonces_per_origin: usize,
    pub max_payload_bytes: usize,
}

impl Default for GuardSection {
    fn default() -> Self {
        let defaults = GuardConfig::default();
        Self {
            clock_skew_secs: defaults.clock_skew.as_secs(),
            nonce_retention_secs: defaults.nonce_retention.as_secs(),
            max_nonces_per_origin: defaults.max_nonces_per_origin,
            max_payload_bytes: defaults.max_payload_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvergenceSection {
    pub metric: Metric,
    pub auto_commit: f64,
    pub review_floor: f64,
}

impl Default for ConvergenceSection {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            auto_commit: DEFAULT_AUTO_COMMIT,
            review_floor: DEFAULT_REVIEW_FLOOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub id: String,
    /// Ed25519 public key, hex
    pub public_key: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Starting state vector; zeros when absent
    #[serde(default)]
    pub initial_state: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalEntry {
    pub id: String,
    pub public_key: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./lattice-data")
}

fn default_api_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl LatticeConfig {
    /// Load the file named by `LATTICE_CONFIG` and apply env overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("LATTICE_CONFIG").unwrap_or_else(|_| "./lattice.toml".to_string());
        let mut config = Self::parse(&read(Path::new(&path))?)?;

        if let Ok(dir) = std::env::var("LATTICE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("LATTICE_API_ADDR") {
            config.api_addr = addr
                .parse()
                .map_err(|e| Error::Config(format!("invalid LATTICE_API_ADDR {addr:?}: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file, without env overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::parse(&read(path.as_ref())?)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text. Does not validate.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("at least one [[nodes]] entry is required".into()));
        }
        if self.model.state_dim == 0 || self.model.input_dim == 0 {
            return Err(Error::Config("model dimensions must be positive".into()));
        }
        if !self.model.bound.is_finite() || self.model.bound <= 0.0 {
            return Err(Error::Config(format!("model bound {} must be positive", self.model.bound)));
        }
        if self.dispatch.timeout_ms == 0 {
            return Err(Error::Config("dispatch.timeout_ms must be positive".into()));
        }

        let mut ids = HashSet::new();
        let principals = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.public_key.as_str()))
            .chain(self.callers.iter().map(|c| (c.id.as_str(), c.public_key.as_str())))
            .chain(self.validators.iter().map(|v| (v.id.as_str(), v.public_key.as_str())));
        for (id, key) in principals {
            if id.is_empty() || id == "*" || id.starts_with('@') {
                return Err(Error::Config(format!("invalid principal id {id:?}")));
            }
            if !ids.insert(id) {
                return Err(Error::Config(format!("duplicate principal id {id:?}")));
            }
            parse_verifying_key(key).map_err(|e| Error::Config(format!("{id}: {e}")))?;
        }

        for node in &self.nodes {
            if let Some(initial) = &node.initial_state {
                if initial.len() != self.model.state_dim {
                    return Err(Error::Config(format!(
                        "{}: initial_state has {} values, model.state_dim is {}",
                        node.id,
                        initial.len(),
                        self.model.state_dim
                    )));
                }
                if initial.iter().any(|x| !x.is_finite()) {
                    return Err(Error::Config(format!("{}: initial_state is not finite", node.id)));
                }
            }
        }

        self.policy()?;
        Ok(())
    }

    /// Build the node registry from the principal sections.
    pub fn registry(&self) -> Result<Registry> {
        let key = |id: &str, hex: &str| parse_verifying_key(hex).map_err(|e| Error::Config(format!("{id}: {e}")));

        let mut registry = Registry::new();
        for node in &self.nodes {
            let public_key = key(&node.id, &node.public_key)?;
            registry = registry.with_node(NodeRecord::new(&node.id, public_key, &node.capabilities));
        }
        for caller in &self.callers {
            registry = registry.with_caller(&caller.id, key(&caller.id, &caller.public_key)?);
        }
        for validator in &self.validators {
            registry = registry.with_validator(&validator.id, key(&validator.id, &validator.public_key)?);
        }
        Ok(registry)
    }

    pub fn policy(&self) -> Result<ConvergencePolicy> {
        let thresholds = ConvergenceThresholds::new(self.convergence.auto_commit, self.convergence.review_floor)?;
        Ok(ConvergencePolicy::new(self.convergence.metric, thresholds))
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            clock_skew: Duration::from_secs(self.guard.clock_skew_secs),
            nonce_retention: Duration::from_secs(self.guard.nonce_retention_secs),
            max_nonces_per_origin: self.guard.max_nonces_per_origin,
            max_payload_bytes: self.guard.max_payload_bytes,
        }
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.timeout_ms)
    }

    pub fn audit_window(&self) -> Duration {
        Duration::from_secs(self.dispatch.audit_window_secs)
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))
}
