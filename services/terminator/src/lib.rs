//! nodereap terminator
//!
//! Keeps a cluster node registry and a compute provider in step. A node the
//! registry reports Unreachable has its instances terminated; an instance the
//! provider reports terminated has its registry node deleted. The two sides
//! are matched by a correlation key that the registry assigns and that the
//! instance carries as a tag.
//!
//! ## Architecture
//!
//! ```text
//! RegistryPoller(Unreachable) ──keys──▶ compute loop  ──▶ ComputeProvider::terminate_by_correlation_key
//! RegistryPoller(Terminated)  ──keys──┘   (optional sweep)
//! ComputePoller(terminal)     ──keys──▶ registry loop ──▶ NodeRegistry::delete_by_correlation_key
//!
//! every component ──Failure──▶ ErrorSink ──▶ error reporter (logs)
//! ```
//!
//! Both loops claim `(key, target)` in a shared [`DedupStore`] before acting,
//! so repeated observations of a key produce at most one action per target.

pub mod compute;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod poller;
pub mod registry;
pub mod sink;

use std::sync::Arc;
use std::time::Duration;

use nodereap_reconcile::DedupStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::compute::ComputeProvider;
use crate::config::Config;
use crate::coordinator::ReconciliationCoordinator;
use crate::poller::{run_poller, ComputePoller, RegistryPoller};
use crate::registry::{NodeRegistry, NodeState};
use crate::sink::{run_error_reporter, ErrorSink};

/// Resolves once shutdown is requested.
///
/// A dropped sender counts as a shutdown request.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// The shared state and collaborators the service runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn NodeRegistry>,
    pub compute: Arc<dyn ComputeProvider>,
    pub dedup: Arc<dyn DedupStore>,
}

/// Floor applied to [`ServiceOptions::poll_interval`].
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Tunables for [`start`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Clamped to at least [`MIN_POLL_INTERVAL`].
    pub poll_interval: Duration,
    pub channel_capacity: usize,
    pub error_buffer: usize,
    pub sweep_registry_terminated: bool,
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            channel_capacity: config.channel_capacity,
            error_buffer: config.error_buffer,
            sweep_registry_terminated: config.sweep_registry_terminated,
        }
    }
}

/// Handles of a running service.
pub struct Service {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    errors: ErrorSink,
}

impl Service {
    /// Wait for every task to finish. Tasks exit once shutdown is signalled.
    ///
    /// Returns the number of failures dropped because the error sink was
    /// full, counted after the last task has exited.
    pub async fn join(self) -> u64 {
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => info!(task = name, "Task exited"),
                Err(e) => error!(task = name, error = %e, "Task panicked"),
            }
        }
        self.errors.dropped()
    }
}

/// Spawn the pollers, the coordinator loops and the error reporter.
pub fn start(
    collaborators: Collaborators,
    options: ServiceOptions,
    shutdown: watch::Receiver<bool>,
) -> Service {
    let mut options = options;
    if options.poll_interval < MIN_POLL_INTERVAL {
        warn!(
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            min_ms = MIN_POLL_INTERVAL.as_millis() as u64,
            "Poll interval below minimum, clamping"
        );
        options.poll_interval = MIN_POLL_INTERVAL;
    }

    let (errors, error_rx) = ErrorSink::channel(options.error_buffer);
    let (unreachable_tx, unreachable_rx) = mpsc::channel(options.channel_capacity.max(1));
    let (terminal_tx, terminal_rx) = mpsc::channel(options.channel_capacity.max(1));

    let coordinator = Arc::new(ReconciliationCoordinator::new(
        Arc::clone(&collaborators.dedup),
        Arc::clone(&collaborators.registry),
        Arc::clone(&collaborators.compute),
        errors.clone(),
    ));

    let mut tasks = Vec::new();

    tasks.push((
        "error_reporter",
        tokio::spawn(run_error_reporter(error_rx, shutdown.clone())),
    ));

    tasks.push(("compute_loop", {
        let coordinator = Arc::clone(&coordinator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { coordinator.run_compute_loop(unreachable_rx, shutdown).await })
    }));

    tasks.push(("registry_loop", {
        let coordinator = Arc::clone(&coordinator);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { coordinator.run_registry_loop(terminal_rx, shutdown).await })
    }));

    if options.sweep_registry_terminated {
        let poller = RegistryPoller::new(
            Arc::clone(&collaborators.registry),
            NodeState::Terminated,
            options.poll_interval,
        );
        let (tx, errors, shutdown) = (unreachable_tx.clone(), errors.clone(), shutdown.clone());
        tasks.push((
            "registry_sweep",
            tokio::spawn(async move { run_poller(&poller, tx, errors, shutdown).await }),
        ));
    }

    tasks.push(("registry_poller", {
        let poller = RegistryPoller::new(
            Arc::clone(&collaborators.registry),
            NodeState::Unreachable,
            options.poll_interval,
        );
        let (errors, shutdown) = (errors.clone(), shutdown.clone());
        tokio::spawn(async move { run_poller(&poller, unreachable_tx, errors, shutdown).await })
    }));

    tasks.push(("compute_poller", {
        let poller = ComputePoller::new(Arc::clone(&collaborators.compute), options.poll_interval);
        let (errors, shutdown) = (errors.clone(), shutdown);
        tokio::spawn(async move { run_poller(&poller, terminal_tx, errors, shutdown).await })
    }));

    info!(
        poll_interval_ms = options.poll_interval.as_millis() as u64,
        channel_capacity = options.channel_capacity,
        sweep_registry_terminated = options.sweep_registry_terminated,
        "Terminator started"
    );

    Service { tasks, errors }
}
