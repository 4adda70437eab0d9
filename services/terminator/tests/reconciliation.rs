//! Integration tests for the reconciliation flow.
//!
//! These tests run the whole service (pollers, coordinator loops, error
//! reporter) against the mock registry and compute provider:
//! 1. Pollers observe keys on every tick
//! 2. The coordinator claims each key per target before acting
//! 3. Actions reach the mocks at most once per key and target
//!
//! Time is paused, so ticks advance deterministically.

use std::sync::Arc;
use std::time::Duration;

use nodereap_id::CorrelationKey;
use nodereap_reconcile::{ClaimState, DedupStore, InMemoryDedupStore, RetryPolicy, TargetSystem};
use nodereap_terminator::compute::{LifecycleState, MockComputeProvider};
use nodereap_terminator::coordinator::{ReconcileOutcome, ReconciliationCoordinator};
use nodereap_terminator::error::ProviderError;
use nodereap_terminator::registry::{MockNodeRegistry, NodeState};
use nodereap_terminator::sink::ErrorSink;
use nodereap_terminator::{start, Collaborators, ServiceOptions};
use tokio::sync::watch;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

struct Fixture {
    registry: Arc<MockNodeRegistry>,
    compute: Arc<MockComputeProvider>,
    dedup: Arc<InMemoryDedupStore>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            registry: Arc::new(MockNodeRegistry::new()),
            compute: Arc::new(MockComputeProvider::new()),
            dedup: Arc::new(InMemoryDedupStore::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            registry: self.registry.clone(),
            compute: self.compute.clone(),
            dedup: self.dedup.clone(),
        }
    }

    /// Run the service for `ticks` poll intervals, then shut it down.
    ///
    /// Returns the number of failures the error sink dropped.
    async fn run_ticks(&self, ticks: u32, sweep_registry_terminated: bool) -> u64 {
        let options = ServiceOptions {
            poll_interval: POLL_INTERVAL,
            channel_capacity: 4,
            error_buffer: 16,
            sweep_registry_terminated,
        };
        // First tick fires immediately; stop halfway to the next one.
        self.run_for(options, POLL_INTERVAL * (ticks - 1) + POLL_INTERVAL / 2)
            .await
    }

    async fn run_for(&self, options: ServiceOptions, duration: Duration) -> u64 {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = start(self.collaborators(), options, shutdown_rx);

        tokio::time::sleep(duration).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), service.join())
            .await
            .expect("service did not shut down")
    }
}

fn key(s: &str) -> CorrelationKey {
    CorrelationKey::parse(s).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_node_terminated_once_then_deleted_once() {
    let fx = Fixture::new();
    fx.registry.add_node("abc-1", NodeState::Unreachable);
    fx.compute.add_instance("i-abc1", "abc-1", LifecycleState::Running);

    assert_eq!(fx.run_ticks(3, false).await, 0);

    // Observed Unreachable on every tick, terminated once.
    assert!(fx.registry.list_calls().len() >= 3);
    assert_eq!(fx.compute.lookup_count("abc-1"), 1);
    assert_eq!(fx.compute.terminate_calls().len(), 1);
    assert_eq!(
        fx.compute.lifecycle_state("i-abc1"),
        Some(LifecycleState::ShuttingDown)
    );

    // The terminating instance is then observed as terminal and its node is
    // deleted, independently of the compute claim.
    assert_eq!(fx.registry.delete_count("abc-1"), 1);
    assert_eq!(
        fx.dedup.state(&key("abc-1"), TargetSystem::Compute),
        Some(ClaimState::Confirmed)
    );
    assert_eq!(
        fx.dedup.state(&key("abc-1"), TargetSystem::Registry),
        Some(ClaimState::Confirmed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_terminated_instance_without_live_match_deletes_node_only() {
    let fx = Fixture::new();
    fx.registry.add_node("xyz-9", NodeState::Terminated);
    fx.compute.add_instance("i-xyz9", "xyz-9", LifecycleState::Terminated);

    fx.run_ticks(3, false).await;

    assert_eq!(fx.registry.delete_count("xyz-9"), 1);
    assert!(fx.compute.lookups().is_empty());
    assert!(fx.compute.terminate_calls().is_empty());
    assert!(fx.dedup.state(&key("xyz-9"), TargetSystem::Compute).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_list_does_not_stop_poller() {
    let fx = Fixture::new();
    fx.registry.add_node("abc-2", NodeState::Unreachable);
    fx.compute.add_instance("i-abc2", "abc-2", LifecycleState::Running);
    fx.registry
        .fail_next_list(ProviderError::Connectivity("connection refused".to_string()));
    fx.registry
        .fail_next_list(ProviderError::remote(Some(503), "Service Unavailable"));

    fx.run_ticks(4, false).await;

    assert_eq!(fx.compute.terminate_calls().len(), 1);
    assert!(fx.registry.list_calls().len() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_compute_poll_does_not_stop_poller() {
    let fx = Fixture::new();
    fx.registry.add_node("abc-3", NodeState::Terminated);
    fx.compute.add_instance("i-abc3", "abc-3", LifecycleState::Terminated);
    fx.compute
        .fail_next_find_terminal(ProviderError::Decode("unexpected end of input".to_string()));

    fx.run_ticks(3, false).await;

    assert!(fx.compute.find_terminal_calls() >= 2);
    assert_eq!(fx.registry.delete_count("abc-3"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_termination_is_not_retried_by_default() {
    let fx = Fixture::new();
    fx.registry.add_node("abc-4", NodeState::Unreachable);
    fx.compute.add_instance("i-abc4", "abc-4", LifecycleState::Running);
    fx.compute
        .fail_next_terminate(ProviderError::Connectivity("timeout".to_string()));

    fx.run_ticks(3, false).await;

    assert_eq!(fx.compute.terminate_calls().len(), 1);
    assert_eq!(
        fx.compute.lifecycle_state("i-abc4"),
        Some(LifecycleState::Running)
    );
    assert_eq!(
        fx.dedup.state(&key("abc-4"), TargetSystem::Compute),
        Some(ClaimState::Failed { attempts: 1 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_registry_terminated_sweep_feeds_compute_loop() {
    let fx = Fixture::new();
    fx.registry.add_node("abc-5", NodeState::Terminated);
    fx.compute.add_instance("i-abc5", "abc-5", LifecycleState::Running);

    fx.run_ticks(3, true).await;

    assert_eq!(fx.compute.terminate_calls().len(), 1);
    assert_eq!(fx.registry.delete_count("abc-5"), 1);
    assert!(fx.registry.list_calls().contains(&NodeState::Terminated));
}

#[tokio::test(start_paused = true)]
async fn test_sweep_disabled_by_default() {
    let fx = Fixture::new();
    fx.registry.add_node("abc-6", NodeState::Terminated);
    fx.compute.add_instance("i-abc6", "abc-6", LifecycleState::Running);

    fx.run_ticks(2, false).await;

    assert!(fx.compute.terminate_calls().is_empty());
    assert!(!fx.registry.list_calls().contains(&NodeState::Terminated));
}

#[tokio::test]
async fn test_bounded_retry_reattempts_failed_termination() {
    let registry = Arc::new(MockNodeRegistry::new());
    let compute = Arc::new(MockComputeProvider::new());
    let dedup = Arc::new(InMemoryDedupStore::with_policy(RetryPolicy::bounded(
        2,
        Duration::ZERO,
    )));
    let (sink, mut errors) = ErrorSink::channel(8);
    let coordinator =
        ReconciliationCoordinator::new(dedup.clone(), registry.clone(), compute.clone(), sink);

    compute.add_instance("i-abc7", "abc-7", LifecycleState::Running);
    compute.fail_next_terminate(ProviderError::remote(Some(500), "InternalError"));

    let k = key("abc-7");
    assert_eq!(coordinator.handle_unreachable(&k).await, ReconcileOutcome::Failed);
    assert_eq!(coordinator.handle_unreachable(&k).await, ReconcileOutcome::Completed);
    assert_eq!(coordinator.handle_unreachable(&k).await, ReconcileOutcome::Skipped);

    assert_eq!(compute.terminate_calls().len(), 2);
    assert_eq!(dedup.state(&k, TargetSystem::Compute), Some(ClaimState::Confirmed));
    assert!(errors.try_recv().is_ok());
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_bounded_retry_gives_up_after_max_attempts() {
    let registry = Arc::new(MockNodeRegistry::new());
    let compute = Arc::new(MockComputeProvider::new());
    let dedup = Arc::new(InMemoryDedupStore::with_policy(RetryPolicy::bounded(
        2,
        Duration::ZERO,
    )));
    let (sink, _errors) = ErrorSink::channel(8);
    let coordinator =
        ReconciliationCoordinator::new(dedup.clone(), registry.clone(), compute.clone(), sink);

    registry.add_node("abc-8", NodeState::Terminated);
    registry.fail_next_delete(ProviderError::Connectivity("reset".to_string()));
    registry.fail_next_delete(ProviderError::Connectivity("reset".to_string()));

    let k = key("abc-8");
    assert_eq!(coordinator.handle_terminated(&k).await, ReconcileOutcome::Failed);
    assert_eq!(coordinator.handle_terminated(&k).await, ReconcileOutcome::Failed);
    assert_eq!(coordinator.handle_terminated(&k).await, ReconcileOutcome::Skipped);

    assert_eq!(registry.delete_count("abc-8"), 2);
    assert_eq!(
        dedup.state(&k, TargetSystem::Registry),
        Some(ClaimState::Failed { attempts: 2 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_after_burst_of_keys() {
    let fx = Fixture::new();
    for n in 0..20 {
        fx.registry.add_node(&format!("node-{n}"), NodeState::Unreachable);
    }

    // More keys than the channel holds: the poller blocks on send until the
    // compute loop catches up.
    fx.run_ticks(1, false).await;

    assert_eq!(fx.compute.lookups().len(), 20);
    assert!(fx.compute.terminate_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_poll_interval_is_clamped() {
    let fx = Fixture::new();
    fx.registry.add_node("abc-9", NodeState::Unreachable);
    fx.compute.add_instance("i-abc9", "abc-9", LifecycleState::Running);

    let options = ServiceOptions {
        poll_interval: Duration::ZERO,
        channel_capacity: 4,
        error_buffer: 16,
        sweep_registry_terminated: false,
    };
    fx.run_for(options, Duration::from_millis(5)).await;

    assert!(fx.registry.list_calls().len() >= 2);
    assert_eq!(fx.compute.terminate_calls().len(), 1);
}
