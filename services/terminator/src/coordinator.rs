//! Reconciliation coordinator.
//!
//! The coordinator runs two independent action loops:
//! - Unreachable registry nodes: terminate the instances behind the key
//! - Terminal compute instances: delete the registry node behind the key
//!
//! Every action goes through the dedup store first, so a key observed many
//! times (by the same loop across ticks, or by several pollers feeding one
//! loop) triggers at most one in-flight action per target system.

use std::sync::Arc;

use nodereap_id::CorrelationKey;
use nodereap_reconcile::{DedupStore, TargetSystem};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::compute::{ComputeProvider, TerminateOutcome};
use crate::error::{Component, Failure, Operation, ProviderError};
use crate::registry::NodeRegistry;
use crate::shutdown_requested;
use crate::sink::ErrorSink;

/// What happened to one observed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The key was already claimed for this target; nothing was called.
    Skipped,

    /// The action was issued and succeeded.
    Completed,

    /// No compute instance carries the key; the claim stands.
    NoMatch,

    /// The action failed and was reported to the error sink.
    Failed,
}

/// Routes observed keys to termination actions.
pub struct ReconciliationCoordinator {
    dedup: Arc<dyn DedupStore>,
    registry: Arc<dyn NodeRegistry>,
    compute: Arc<dyn ComputeProvider>,
    errors: ErrorSink,
}

impl ReconciliationCoordinator {
    pub fn new(
        dedup: Arc<dyn DedupStore>,
        registry: Arc<dyn NodeRegistry>,
        compute: Arc<dyn ComputeProvider>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            dedup,
            registry,
            compute,
            errors,
        }
    }

    /// The node behind `key` is unreachable: terminate its instances.
    #[instrument(skip(self, key), fields(correlation_key = %key))]
    pub async fn handle_unreachable(&self, key: &CorrelationKey) -> ReconcileOutcome {
        if !self.claim(key, TargetSystem::Compute) {
            return ReconcileOutcome::Skipped;
        }

        match self.compute.terminate_by_correlation_key(key).await {
            Ok(TerminateOutcome::NoMatch) => {
                self.dedup.confirm(key, TargetSystem::Compute);
                info!("No live instance for unreachable node");
                ReconcileOutcome::NoMatch
            }
            Ok(TerminateOutcome::Terminated { instances }) => {
                self.dedup.confirm(key, TargetSystem::Compute);
                info!(
                    instance_ids = ?instances.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
                    "Terminated instances of unreachable node"
                );
                ReconcileOutcome::Completed
            }
            Err(e) => self.record_failure(
                key,
                TargetSystem::Compute,
                Operation::TerminateByCorrelationKey,
                e,
            ),
        }
    }

    /// The instance behind `key` is terminal: delete its registry node.
    #[instrument(skip(self, key), fields(correlation_key = %key))]
    pub async fn handle_terminated(&self, key: &CorrelationKey) -> ReconcileOutcome {
        if !self.claim(key, TargetSystem::Registry) {
            return ReconcileOutcome::Skipped;
        }

        match self.registry.delete_by_correlation_key(key).await {
            Ok(()) => {
                self.dedup.confirm(key, TargetSystem::Registry);
                info!("Deleted registry node of terminated instance");
                ReconcileOutcome::Completed
            }
            Err(e) => self.record_failure(
                key,
                TargetSystem::Registry,
                Operation::DeleteByCorrelationKey,
                e,
            ),
        }
    }

    /// Consume keys of unreachable nodes until shutdown or until every
    /// sender is gone.
    #[instrument(skip_all, fields(target_system = %TargetSystem::Compute))]
    pub async fn run_compute_loop(
        &self,
        mut rx: mpsc::Receiver<CorrelationKey>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting compute termination loop");

        loop {
            let key = tokio::select! {
                key = rx.recv() => key,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            let Some(key) = key else { break };
            self.handle_unreachable(&key).await;
        }

        info!(stats = ?self.dedup.stats(), "Compute termination loop shutting down");
    }

    /// Consume keys of terminal instances until shutdown or until every
    /// sender is gone.
    #[instrument(skip_all, fields(target_system = %TargetSystem::Registry))]
    pub async fn run_registry_loop(
        &self,
        mut rx: mpsc::Receiver<CorrelationKey>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting registry deletion loop");

        loop {
            let key = tokio::select! {
                key = rx.recv() => key,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            let Some(key) = key else { break };
            self.handle_terminated(&key).await;
        }

        info!(stats = ?self.dedup.stats(), "Registry deletion loop shutting down");
    }

    fn claim(&self, key: &CorrelationKey, target: TargetSystem) -> bool {
        let claimed = self.dedup.try_claim(key, target);
        if !claimed {
            debug!(
                target_system = %target,
                state = ?self.dedup.state(key, target),
                "Key already claimed, skipping"
            );
        }
        claimed
    }

    fn record_failure(
        &self,
        key: &CorrelationKey,
        target: TargetSystem,
        operation: Operation,
        cause: ProviderError,
    ) -> ReconcileOutcome {
        self.dedup.fail(key, target);
        warn!(target_system = %target, error = %cause, "Termination action failed");
        self.errors.report(
            Failure::new(Component::Coordinator, operation, cause)
                .with_key(key.clone())
                .with_detail(format!("target={target}")),
        );
        ReconcileOutcome::Failed
    }
}
