// Step and agent identifiers - the basic building blocks of the workflow DAG

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for one node in a workflow DAG
///
/// Step ids are author-chosen strings ("reserve_inventory", "price_quote").
/// They must be unique across a definition, including steps nested inside
/// parallel groups and conditional branches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    /// Get the step identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StepId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to an external agent by name and version
///
/// Agents are opaque external collaborators. A reference resolves to an
/// [`crate::AgentEndpoint`] through the registry at submission time and again
/// at each invocation, so endpoint swaps take effect for the next call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRef {
    pub name: String,
    pub version: String,
}

impl AgentRef {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}
