//! Directive actions and addressing.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The closed set of directive actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Analyze,
    Generate,
    Verify,
    ExecutePlan,
    ValidateOutput,
    Heartbeat,
    Snapshot,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Analyze,
        Action::Generate,
        Action::Verify,
        Action::ExecutePlan,
        Action::ValidateOutput,
        Action::Heartbeat,
        Action::Snapshot,
    ];

    /// Stable wire code.
    pub const fn code(self) -> u8 {
        match self {
            Action::Analyze => 1,
            Action::Generate => 2,
            Action::Verify => 3,
            Action::ExecutePlan => 4,
            Action::ValidateOutput => 5,
            Action::Heartbeat => 6,
            Action::Snapshot => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.code() == code)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Analyze => "ANALYZE",
            Action::Generate => "GENERATE",
            Action::Verify => "VERIFY",
            Action::ExecutePlan => "EXECUTE_PLAN",
            Action::ValidateOutput => "VALIDATE_OUTPUT",
            Action::Heartbeat => "HEARTBEAT",
            Action::Snapshot => "SNAPSHOT",
        }
    }

    /// Whether the action drives a state transition. HEARTBEAT and SNAPSHOT
    /// only observe the node.
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Action::Heartbeat | Action::Snapshot)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::malformed(format!("unknown action {s:?}")))
    }
}

/// Where a directive is addressed.
///
/// Text form: `*` broadcasts, `@tag` selects every node advertising the
/// capability tag, anything else names a single node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Node(String),
    Broadcast,
    Capability(String),
}

impl Target {
    pub const WILDCARD: &'static str = "*";

    pub fn node(id: impl Into<String>) -> Self {
        Target::Node(id.into())
    }

    pub fn is_fan_out(&self) -> bool {
        !matches!(self, Target::Node(_))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Node(id) => f.write_str(id),
            Target::Broadcast => f.write_str(Self::WILDCARD),
            Target::Capability(tag) => write!(f, "@{tag}"),
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::WILDCARD {
            return Ok(Target::Broadcast);
        }
        if let Some(tag) = s.strip_prefix('@') {
            if tag.is_empty() {
                return Err(Error::malformed("empty capability selector"));
            }
            return Ok(Target::Capability(tag.to_string()));
        }
        if s.is_empty() || s.contains('*') {
            return Err(Error::malformed(format!("invalid node target {s:?}")));
        }
        Ok(Target::Node(s.to_string()))
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
