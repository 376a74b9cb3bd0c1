use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing_subscriber::EnvFilter;

use culvert::config::ClientConfig;
use culvert::session::{establish, SessionConfig, SessionError};

/// Culvert - tunnel client for exposing a local HTTP service
#[derive(Parser, Debug)]
#[command(name = "culvert")]
#[command(about = "Expose a local HTTP service through a culvert tunnel")]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "culvert.toml")]
    config: String,

    /// Tunnel server address (host:port)
    #[arg(short, long)]
    server: Option<String>,

    /// Local address to forward to (e.g., 127.0.0.1:3000)
    #[arg(short, long)]
    local: Option<String>,

    /// Requested subdomain (optional, server assigns one if omitted)
    #[arg(long)]
    subdomain: Option<String>,

    /// Shared auth token expected by the server
    #[arg(long)]
    auth_token: Option<String>,

    /// Client certificate PEM path
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key PEM path
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA certificate PEM path
    #[arg(long)]
    ca: Option<PathBuf>,
}

/// Resolved configuration from CLI args and/or config file
struct ResolvedConfig {
    server_addr: String,
    session: SessionConfig,
    cert_path: PathBuf,
    key_path: PathBuf,
    ca_cert_path: PathBuf,
}

impl ResolvedConfig {
    /// CLI flags win over the config file.
    fn resolve(cli: Cli) -> Result<Self> {
        let file = ClientConfig::load(&cli.config);

        let server_addr = cli
            .server
            .or(file.server_addr)
            .context("Server address required. Use --server or server_addr in config")?;

        let local_addr = cli
            .local
            .or(file.local_addr)
            .context("Local address required. Use --local (e.g., --local 127.0.0.1:3000)")?;

        let cert_path = cli
            .cert
            .or(file.cert_path)
            .context("Client certificate required. Use --cert or cert_path in config")?;

        let key_path = cli
            .key
            .or(file.key_path)
            .context("Private key required. Use --key or key_path in config")?;

        let ca_cert_path = cli
            .ca
            .or(file.ca_cert_path)
            .context("CA certificate required. Use --ca or ca_cert_path in config")?;

        let mut session = SessionConfig::new(local_addr);
        session.routing_key = cli.subdomain.or(file.routing_key);
        session.auth_token = cli.auth_token.or(file.auth_token);
        if let Some(secs) = file.health_interval_secs {
            session.health_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.probe_timeout_secs {
            session.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.grace_period_secs {
            session.grace_period = Duration::from_secs(secs);
        }

        Ok(Self {
            server_addr,
            session,
            cert_path,
            key_path,
            ca_cert_path,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("culvert=info".parse()?)
                .add_directive("culvert_common=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = ResolvedConfig::resolve(cli)?;

    let tls_config = culvert_common::load_client_config(
        &config.cert_path,
        &config.key_path,
        &config.ca_cert_path,
    )
    .context("Failed to load TLS configuration")?;
    let tls_connector = TlsConnector::from(Arc::new(tls_config));

    let server_host = config
        .server_addr
        .split(':')
        .next()
        .context("Invalid server address")?;
    let server_name = ServerName::try_from(server_host.to_string())
        .map_err(|_| anyhow::anyhow!("Invalid server hostname: {}", server_host))?;

    tracing::info!(
        "Connecting to {} to expose {}",
        config.server_addr,
        config.session.local_addr
    );

    // Reconnection loop
    loop {
        tokio::select! {
            result = run_tunnel(
                &config.server_addr,
                config.session.clone(),
                tls_connector.clone(),
                server_name.clone(),
            ) => {
                match result {
                    Ok(()) => {
                        tracing::info!("Tunnel closed normally");
                        break;
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!("Tunnel failed permanently: {}", e);
                        return Err(e.into());
                    }
                    Err(e) => {
                        tracing::error!("Tunnel error: {}", e);
                        tracing::info!("Reconnecting in 5 seconds...");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("Client shutdown complete");
    Ok(())
}

async fn run_tunnel(
    server_addr: &str,
    session_config: SessionConfig,
    tls_connector: TlsConnector,
    server_name: ServerName<'static>,
) -> Result<(), SessionError> {
    let stream = TcpStream::connect(server_addr).await?;
    let tls_stream = tls_connector.connect(server_name, stream).await?;

    let session = establish(tls_stream, session_config).await?;
    tracing::info!(
        "Tunnel active: routing key '{}' -> {}",
        session.routing_key(),
        server_addr
    );

    session.run().await
}

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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
