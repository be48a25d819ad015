//! consul-notifier
//!
//! Registers Docker Swarm services that declare `CONSUL_SERVICE_PORT` with
//! the local Consul agent, and deregisters them when they go away.
//!
//! ## Architecture
//!
//! - **Startup Reconciler**: Diffs Swarm services against Consul once per subscription
//! - **Engine**: Applies service lifecycle events as they arrive
//! - **Supervisor**: Decides what happens when the event stream is lost

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use consul_notifier::config::Config;
use consul_notifier::{ConsulClient, DockerClient, Supervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to the configured level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting consul-notifier");
    info!(
        docker_socket = %config.socket_path(),
        consul_url = %config.consul_url(),
        resync_on_disconnect = config.resync_on_disconnect,
        verbosity = config.verbose,
        "Configuration loaded"
    );

    let docker = Arc::new(DockerClient::new(config.socket_path()));
    if !docker.socket_exists() {
        warn!(docker_socket = %config.socket_path(), "Docker socket not found");
    }

    let node_addr = match config.node_addr.clone() {
        Some(addr) => addr,
        None => docker
            .node_address()
            .await
            .context("Failed to query Docker for the Swarm node address")?
            .context("Docker is not part of a Swarm; set NOTIFIER_NODE_ADDR")?,
    };
    info!(node_addr = %node_addr, "Registering services under node address");

    let consul = Arc::new(
        ConsulClient::new(&config.consul_url(), config.consul_token.clone(), node_addr)
            .context("Failed to build Consul client")?
            .with_tls_skip_verify(config.health_tls_skip_verify),
    );

    let supervisor = Supervisor::new(
        docker,
        consul,
        SupervisorConfig {
            resync_on_disconnect: config.resync_on_disconnect,
            ..SupervisorConfig::default()
        },
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    info!("Consul notifier ready to process Docker event stream");

    // Let in-flight registry calls finish after a shutdown signal
    let result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            (&mut handle).await
        }
        result = &mut handle => result,
    };

    match result {
        Ok(Ok(())) => {
            info!("consul-notifier shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Reconciliation stopped");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Supervisor task panicked");
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
