//! Fan-in of structured failures from the pollers and the coordinator.
//!
//! Producers never wait on the sink. When the buffer is full the newest
//! failure is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use crate::error::Failure;
use crate::shutdown_requested;

/// Sending half of the failure channel. Cheap to clone.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<Failure>,
    dropped: Arc<AtomicU64>,
}

impl ErrorSink {
    /// Create a sink with room for `capacity` unreported failures.
    ///
    /// `capacity` is clamped to at least 1.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Failure>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Report a failure without blocking.
    pub fn report(&self, failure: Failure) {
        match self.tx.try_send(failure) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(failure)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    origin = %failure.origin,
                    operation = %failure.operation,
                    dropped_total = dropped,
                    "Error sink full, dropping failure"
                );
            }
            Err(mpsc::error::TrySendError::Closed(failure)) => {
                // Reporter is gone (shutdown); keep the failure visible.
                warn!(error = %failure, "Error sink closed, failure not reported");
            }
        }
    }

    /// Failures dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Render failures as structured log events until shutdown.
///
/// Failures still buffered at shutdown are drained before returning.
#[instrument(skip_all)]
pub async fn run_error_reporter(
    mut rx: mpsc::Receiver<Failure>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting error reporter");

    loop {
        tokio::select! {
            failure = rx.recv() => {
                match failure {
                    Some(failure) => log_failure(&failure),
                    None => break,
                }
            }
            _ = shutdown_requested(&mut shutdown) => {
                while let Ok(failure) = rx.try_recv() {
                    log_failure(&failure);
                }
                break;
            }
        }
    }

    info!("Error reporter shutting down");
}

fn log_failure(failure: &Failure) {
    error!(
        origin = %failure.origin,
        operation = %failure.operation,
        correlation_key = failure.key.as_ref().map(|k| k.as_str()),
        detail = failure.detail.as_deref(),
        kind = failure.cause.kind(),
        error = %failure.cause,
        "Reconciliation failure"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::{Component, Operation, ProviderError};

    fn failure(n: usize) -> Failure {
        Failure::new(
            Component::RegistryPoller,
            Operation::ListByState,
            ProviderError::Connectivity(format!("refused #{n}")),
        )
    }

    #[tokio::test]
    async fn test_full_sink_drops_newest_without_blocking() {
        let (sink, mut rx) = ErrorSink::channel(2);

        for n in 0..5 {
            sink.report(failure(n));
        }

        assert_eq!(sink.dropped(), 3);
        assert_eq!(rx.recv().await.unwrap(), failure(0));
        assert_eq!(rx.recv().await.unwrap(), failure(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clones_share_drop_counter() {
        let (sink, _rx) = ErrorSink::channel(1);
        let other = sink.clone();

        sink.report(failure(0));
        other.report(failure(1));

        assert_eq!(sink.dropped(), 1);
        assert_eq!(other.dropped(), 1);
    }

    #[tokio::test]
    async fn test_report_after_receiver_dropped_does_not_panic() {
        let (sink, rx) = ErrorSink::channel(1);
        drop(rx);

        sink.report(failure(0));
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_reporter_drains_and_exits_on_shutdown() {
        let (sink, rx) = ErrorSink::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        sink.report(failure(0));
        sink.report(failure(1));

        let handle = tokio::spawn(run_error_reporter(rx, shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
