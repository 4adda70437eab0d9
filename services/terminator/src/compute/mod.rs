//! Compute provider capability.
//!
//! The compute provider owns the virtual machines. Each machine carries the
//! correlation key of its registry node in a tag.

use std::fmt;

use async_trait::async_trait;
use nodereap_id::{CorrelationKey, InstanceId};
use tracing::debug;

use crate::error::ProviderError;

mod ec2;
mod mock;
mod sigv4;

pub use ec2::{Ec2ComputeProvider, Ec2Config};
pub use mock::MockComputeProvider;
pub use sigv4::Credentials;

/// Instance lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Other(String),
}

impl LifecycleState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Other(s) => s,
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true if the instance can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instance as reported by the compute provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeInstance {
    pub id: InstanceId,
    pub correlation_key: CorrelationKey,
    pub lifecycle_state: LifecycleState,
}

/// Result of terminating the instances behind a correlation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// No live instance carries the key; nothing to do.
    NoMatch,

    /// Termination was requested for these instances.
    Terminated { instances: Vec<InstanceId> },
}

/// Compute provider interface.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Instances with the correlation tag set whose state is terminal.
    async fn find_terminal_instances(&self) -> Result<Vec<ComputeInstance>, ProviderError>;

    /// Instances tagged with `key` that can still be terminated.
    async fn find_instances_by_correlation_key(
        &self,
        key: &CorrelationKey,
    ) -> Result<Vec<ComputeInstance>, ProviderError>;

    /// Terminate the given instances.
    ///
    /// Terminating an instance that is already terminating or terminated
    /// succeeds.
    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ProviderError>;

    /// Terminate every live instance tagged with `key`.
    ///
    /// Finding no instance is a success: the node may never have had one, or
    /// it was already cleaned up.
    async fn terminate_by_correlation_key(
        &self,
        key: &CorrelationKey,
    ) -> Result<TerminateOutcome, ProviderError> {
        let instances = self.find_instances_by_correlation_key(key).await?;
        if instances.is_empty() {
            debug!(correlation_key = %key, "No instances carry correlation key");
            return Ok(TerminateOutcome::NoMatch);
        }

        let ids: Vec<InstanceId> = instances.into_iter().map(|i| i.id).collect();
        self.terminate_instances(&ids).await?;
        Ok(TerminateOutcome::Terminated { instances: ids })
    }
}
