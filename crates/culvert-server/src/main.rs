use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

mod config;
mod control_plane;
mod http_plane;
mod registry;
mod session;

use config::ServerConfig;
use control_plane::{ControlPlane, SessionSettings};
use http_plane::HttpPlane;
use registry::ConnectionRegistry;

/// Tunnel server - accepts tunnel connections and routes public traffic
#[derive(Parser, Debug)]
#[command(name = "culvert-server")]
#[command(about = "Self-hosted reverse proxy tunnel server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("culvert_server=info".parse()?)
                .add_directive("culvert_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting tunnel server with config: {}", args.config);

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("Base domain: {}", config.base_domain);
    tracing::info!("Control plane port: {}", config.control_port);
    tracing::info!("HTTP plane port: {}", config.http_port);
    tracing::info!("Registry capacity: {}", config.registry_capacity);

    let tls_config = culvert_common::load_server_config(
        &config.cert_path,
        &config.key_path,
        &config.ca_cert_path,
    )
    .context("Failed to load TLS configuration")?;
    let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let registry = ConnectionRegistry::new(config.registry_capacity);

    let control_plane = ControlPlane::new(
        registry.clone(),
        tls_acceptor,
        SessionSettings {
            auth_token: config.auth_token.clone(),
            health_interval: config.health_interval,
            probe_timeout: config.probe_timeout,
            grace_period: config.grace_period,
        },
    );

    let http_plane = HttpPlane::new(
        registry,
        config.base_domain.clone(),
        config.exchange_timeout,
        None,
    );

    let control_addr: SocketAddr = format!("0.0.0.0:{}", config.control_port).parse()?;
    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;

    tokio::select! {
        result = control_plane.run(control_addr) => {
            tracing::error!("Control plane stopped: {:?}", result);
        }
        result = http_plane.run(http_addr) => {
            tracing::error!("HTTP plane stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
