//! nodereap terminator service
//!
//! Polls the node registry and EC2, terminates the instances of unreachable
//! nodes and deletes the registry records of terminated instances.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nodereap_reconcile::InMemoryDedupStore;
use nodereap_terminator::compute::{Ec2ComputeProvider, Ec2Config};
use nodereap_terminator::config::Config;
use nodereap_terminator::registry::{HttpNodeRegistry, HttpNodeRegistryConfig};
use nodereap_terminator::{start, Collaborators, ServiceOptions};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on waiting for tasks after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        registry_url = %config.registry_url,
        region = %config.region,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        correlation_tag = %config.correlation_tag,
        retry_policy = ?config.retry_policy(),
        "Starting nodereap terminator"
    );

    let mut registry_config =
        HttpNodeRegistryConfig::new(config.registry_url.clone(), config.registry_auth.clone());
    registry_config.timeout = config.http_timeout;
    let registry =
        HttpNodeRegistry::new(registry_config).context("Failed to create node registry client")?;

    let compute = Ec2ComputeProvider::new(Ec2Config {
        region: config.region.clone(),
        endpoint: config.ec2_endpoint.clone(),
        credentials: config.credentials.clone(),
        correlation_tag: config.correlation_tag.clone(),
        timeout: config.http_timeout,
    })
    .context("Failed to create EC2 client")?;

    let collaborators = Collaborators {
        registry: Arc::new(registry),
        compute: Arc::new(compute),
        dedup: Arc::new(InMemoryDedupStore::with_policy(config.retry_policy())),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = start(collaborators, ServiceOptions::from(&config), shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_GRACE, service.join()).await {
        Ok(dropped) => info!(dropped_failures = dropped, "Terminator shutdown complete"),
        Err(_) => warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Tasks did not stop in time"),
    }

    Ok(())
}
