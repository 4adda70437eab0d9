//! Node registry capability.
//!
//! The node registry is the cluster-management system that tracks node
//! reachability. The reconciliation loops only need two things from it:
//! listing nodes in a state, and deleting a node record by correlation key.

use std::fmt;

use async_trait::async_trait;
use nodereap_id::{CorrelationKey, NodeId};

use crate::error::ProviderError;

mod http;
mod mock;

pub use http::{HttpNodeRegistry, HttpNodeRegistryConfig};
pub use mock::MockNodeRegistry;

/// Node state as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeState {
    Running,
    Unreachable,
    Terminated,
    Other(String),
}

impl NodeState {
    /// Wire value understood by the registry's `state` filter.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "Deployed",
            Self::Unreachable => "Unreachable",
            Self::Terminated => "Terminated",
            Self::Other(s) => s,
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "Deployed" => Self::Running,
            "Unreachable" => Self::Unreachable,
            "Terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node record returned by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Registry-native identifier.
    pub id: NodeId,

    /// Key shared with the compute instance. `None` when the registry
    /// returned a record without one.
    pub correlation_key: Option<CorrelationKey>,

    pub state: NodeState,

    /// Opaque passthrough, only used for logging.
    pub nickname: Option<String>,
    pub region: Option<String>,
}

/// Node registry interface.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// List all nodes currently in `state`.
    async fn list_by_state(&self, state: &NodeState) -> Result<Vec<NodeRecord>, ProviderError>;

    /// Delete the node record carrying `key`.
    ///
    /// Deleting a node that is already gone succeeds.
    async fn delete_by_correlation_key(&self, key: &CorrelationKey) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_wire_values() {
        assert_eq!(NodeState::from_wire("Unreachable"), NodeState::Unreachable);
        assert_eq!(NodeState::from_wire("Deployed"), NodeState::Running);
        assert_eq!(
            NodeState::from_wire("Terminating"),
            NodeState::Other("Terminating".to_string())
        );
        assert_eq!(NodeState::Terminated.to_string(), "Terminated");
    }
}
