//! # Service Gateway - Main Entry Point
//!
//! Startup sequence:
//! 1. Load configuration (`GATEWAY_CONFIG_PATH`, default `config/gateway.yaml`)
//! 2. Initialize logging and, if enabled, the Prometheus recorder
//! 3. Build the node registry and the gateway around it
//! 4. Serve until SIGINT/SIGTERM, then drain for `server.shutdown_grace`

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use service_gateway::core::config::GatewayConfig;
use service_gateway::observability::{init_logging, install_prometheus};
use service_gateway::{GatewayResult, GatewayServer, GatewayState, InMemoryRegistry};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Gateway failed: {}", e);
        eprintln!("service-gateway: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> GatewayResult<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load_or_default(&config_path).await?;

    init_logging(&config.observability.logging);
    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path, "Starting service gateway");

    let metrics = if config.observability.metrics.prometheus_enabled {
        let handle = install_prometheus()?;
        info!(path = %config.observability.metrics.endpoint_path, "Prometheus metrics enabled");
        Some(handle)
    } else {
        None
    };

    let registry = Arc::new(InMemoryRegistry::with_event_buffer(config.nodes.event_buffer));
    info!(path = %config.nodes.connect_path, "Nodes attach over WebSocket");

    let state = GatewayState::new(config, registry, metrics);
    GatewayServer::new(state).start(shutdown_signal()).await?;

    info!("Service gateway shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
