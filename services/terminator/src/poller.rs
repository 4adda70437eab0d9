//! Pollers that turn collaborator queries into a stream of correlation keys.
//!
//! A poller queries its collaborator once per tick and sends every key it
//! finds, in the order the collaborator returned them, on a bounded channel.
//! A failed query is reported to the error sink and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodereap_id::CorrelationKey;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::compute::ComputeProvider;
use crate::error::{Component, Failure, Operation};
use crate::registry::{NodeRegistry, NodeState};
use crate::{shutdown_requested, MIN_POLL_INTERVAL};
use crate::sink::ErrorSink;

/// A source of correlation keys queried once per tick.
#[async_trait]
pub trait Poller: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> String;

    fn interval(&self) -> Duration;

    /// Run one query and return the keys it produced.
    async fn poll_once(&self) -> Result<Vec<CorrelationKey>, Failure>;
}

/// Polls the node registry for nodes in one state.
pub struct RegistryPoller {
    registry: Arc<dyn NodeRegistry>,
    state: NodeState,
    interval: Duration,
}

impl RegistryPoller {
    pub fn new(registry: Arc<dyn NodeRegistry>, state: NodeState, interval: Duration) -> Self {
        Self {
            registry,
            state,
            interval,
        }
    }
}

#[async_trait]
impl Poller for RegistryPoller {
    fn name(&self) -> String {
        format!("registry[{}]", self.state)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll_once(&self) -> Result<Vec<CorrelationKey>, Failure> {
        let records = self.registry.list_by_state(&self.state).await.map_err(|e| {
            Failure::new(Component::RegistryPoller, Operation::ListByState, e)
                .with_detail(format!("state={}", self.state))
        })?;

        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            match record.correlation_key {
                Some(key) => keys.push(key),
                None => warn!(
                    node_id = %record.id,
                    nickname = record.nickname.as_deref(),
                    region = record.region.as_deref(),
                    "Registry node has no correlation key, skipping"
                ),
            }
        }
        Ok(keys)
    }
}

/// Polls the compute provider for instances in a terminal state.
pub struct ComputePoller {
    compute: Arc<dyn ComputeProvider>,
    interval: Duration,
}

impl ComputePoller {
    pub fn new(compute: Arc<dyn ComputeProvider>, interval: Duration) -> Self {
        Self { compute, interval }
    }
}

#[async_trait]
impl Poller for ComputePoller {
    fn name(&self) -> String {
        "compute[terminal]".to_string()
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll_once(&self) -> Result<Vec<CorrelationKey>, Failure> {
        let instances = self.compute.find_terminal_instances().await.map_err(|e| {
            Failure::new(Component::ComputePoller, Operation::FindTerminalInstances, e)
        })?;

        Ok(instances.into_iter().map(|i| i.correlation_key).collect())
    }
}

/// Run `poller` until shutdown or until the receiving side goes away.
///
/// The first query runs immediately; later ones follow the poller's
/// interval. Sending blocks while the channel is full, so a slow consumer
/// throttles the poller.
#[instrument(skip_all, fields(poller = %poller.name()))]
pub async fn run_poller<P: Poller + ?Sized>(
    poller: &P,
    tx: mpsc::Sender<CorrelationKey>,
    errors: ErrorSink,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = poller.interval().as_millis() as u64, "Starting poller");

    let mut interval = tokio::time::interval(poller.interval().max(MIN_POLL_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'ticks: loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }

        let keys = tokio::select! {
            result = poller.poll_once() => result,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        let keys = match keys {
            Ok(keys) => keys,
            Err(failure) => {
                errors.report(failure);
                continue;
            }
        };

        debug!(count = keys.len(), "Poll complete");

        for key in keys {
            tokio::select! {
                sent = tx.send(key) => {
                    if sent.is_err() {
                        info!("Key consumer closed, stopping poller");
                        break 'ticks;
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break 'ticks,
            }
        }
    }

    info!("Poller shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{LifecycleState, MockComputeProvider};
    use crate::error::ProviderError;
    use crate::registry::{MockNodeRegistry, NodeRecord};
    use nodereap_id::NodeId;

    #[tokio::test]
    async fn test_registry_poll_skips_records_without_key() {
        let registry = Arc::new(MockNodeRegistry::new());
        registry.add_node("abc-1", NodeState::Unreachable);
        registry.add_record(NodeRecord {
            id: NodeId::parse("no-key").unwrap(),
            correlation_key: None,
            state: NodeState::Unreachable,
            nickname: Some("orphan".to_string()),
            region: None,
        });
        registry.add_node("abc-2", NodeState::Unreachable);
        registry.add_node("abc-3", NodeState::Running);

        let poller = RegistryPoller::new(registry, NodeState::Unreachable, Duration::from_secs(1));
        let keys = poller.poll_once().await.unwrap();

        let keys: Vec<_> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["abc-1", "abc-2"]);
    }

    #[tokio::test]
    async fn test_registry_poll_failure_carries_state() {
        let registry = Arc::new(MockNodeRegistry::new());
        registry.fail_next_list(ProviderError::Connectivity("refused".to_string()));

        let poller = RegistryPoller::new(registry, NodeState::Unreachable, Duration::from_secs(1));
        let failure = poller.poll_once().await.unwrap_err();

        assert_eq!(failure.origin, Component::RegistryPoller);
        assert_eq!(failure.operation, Operation::ListByState);
        assert_eq!(failure.detail.as_deref(), Some("state=Unreachable"));
        assert!(failure.key.is_none());
    }

    #[tokio::test]
    async fn test_compute_poll_emits_terminal_keys() {
        let compute = Arc::new(MockComputeProvider::new());
        compute.add_instance("i-1", "abc-1", LifecycleState::Terminated);
        compute.add_instance("i-2", "abc-2", LifecycleState::Running);
        compute.add_instance("i-3", "abc-3", LifecycleState::ShuttingDown);

        let poller = ComputePoller::new(compute, Duration::from_secs(1));
        let keys = poller.poll_once().await.unwrap();

        let keys: Vec<_> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["abc-1", "abc-3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_survives_failed_tick() {
        let registry = Arc::new(MockNodeRegistry::new());
        registry.add_node("abc-1", NodeState::Unreachable);
        registry.fail_next_list(ProviderError::remote(Some(502), "Bad Gateway"));

        let poller = RegistryPoller::new(
            registry.clone(),
            NodeState::Unreachable,
            Duration::from_secs(10),
        );
        let (tx, mut rx) = mpsc::channel(4);
        let (errors, mut error_rx) = ErrorSink::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            run_poller(&poller, tx, errors, shutdown_rx).await;
        });

        let key = rx.recv().await.unwrap();
        assert_eq!(key.as_str(), "abc-1");

        let failure = error_rx.recv().await.unwrap();
        assert_eq!(failure.cause, ProviderError::remote(Some(502), "Bad Gateway"));
        assert!(registry.list_calls().len() >= 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_poller_keeps_ticking() {
        let registry = Arc::new(MockNodeRegistry::new());
        registry.add_node("abc-1", NodeState::Unreachable);

        let poller = RegistryPoller::new(registry.clone(), NodeState::Unreachable, Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(4);
        let (errors, _error_rx) = ErrorSink::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            run_poller(&poller, tx, errors, shutdown_rx).await;
        });

        assert_eq!(rx.recv().await.unwrap().as_str(), "abc-1");
        assert_eq!(rx.recv().await.unwrap().as_str(), "abc-1");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_when_consumer_closes() {
        let registry = Arc::new(MockNodeRegistry::new());
        registry.add_node("abc-1", NodeState::Unreachable);

        let poller = RegistryPoller::new(registry, NodeState::Unreachable, Duration::from_secs(10));
        let (tx, rx) = mpsc::channel(1);
        let (errors, _error_rx) = ErrorSink::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(rx);

        run_poller(&poller, tx, errors, shutdown_rx).await;
    }
}
