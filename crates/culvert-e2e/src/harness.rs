//! Test server harness for E2E tests
//!
//! Starts a complete culvert server in-process on ephemeral ports, with
//! generated certificates and direct access to the connection registry for
//! assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

use culvert_server::{ConnectionRegistry, ControlPlane, HttpPlane, SessionSettings};

use crate::certificates::TestCertificates;

/// Tunables a test can override before starting the server.
#[derive(Debug, Clone)]
pub struct TestServerOptions {
    pub registry_capacity: usize,
    pub exchange_timeout: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
    pub auth_token: Option<String>,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            registry_capacity: 32,
            exchange_timeout: Duration::from_secs(10),
            health_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(4),
            auth_token: None,
        }
    }
}

/// A running test server instance
pub struct TestServer {
    /// Control plane address (mTLS)
    pub control_addr: SocketAddr,
    /// HTTP plane address
    pub http_addr: SocketAddr,
    /// Base domain for the test server
    pub base_domain: String,
    /// Registry, exposed for assertions
    pub registry: Arc<ConnectionRegistry>,
    /// Certificate set used
    pub certs: Arc<TestCertificates>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a test server with default options.
    pub async fn start() -> Self {
        Self::start_with(TestServerOptions::default()).await
    }

    /// Start a test server with explicit options.
    pub async fn start_with(options: TestServerOptions) -> Self {
        let certs = Arc::new(TestCertificates::generate());
        let base_domain = "test.example.com".to_string();

        let tls_config = culvert_common::load_server_config_from_pem(
            &certs.server_cert_pem,
            &certs.server_key_pem,
            &certs.ca_cert_pem,
        )
        .expect("Failed to load server TLS config");
        let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let registry = ConnectionRegistry::new(options.registry_capacity);

        let control_plane = ControlPlane::new(
            registry.clone(),
            tls_acceptor,
            SessionSettings {
                auth_token: options.auth_token.clone(),
                health_interval: options.health_interval,
                probe_timeout: options.probe_timeout,
                grace_period: options.grace_period,
            },
        );

        // HTTP plane without TLS for simplicity in tests
        let http_plane = HttpPlane::new(
            registry.clone(),
            base_domain.clone(),
            options.exchange_timeout,
            None,
        );

        // Bind to ephemeral ports
        let control_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind control plane");
        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTP plane");

        let control_addr = control_listener.local_addr().unwrap();
        let http_addr = http_listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                result = control_plane.run_with_listener(control_listener) => {
                    if let Err(e) = result {
                        tracing::error!("Control plane error: {}", e);
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("Control plane shutting down");
                }
            }
        });

        tokio::spawn(async move {
            if let Err(e) = http_plane.run_with_listener(http_listener).await {
                tracing::error!("HTTP plane error: {}", e);
            }
        });

        // Give the servers a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            control_addr,
            http_addr,
            base_domain,
            registry,
            certs,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the client TLS config for connecting to this server
    pub fn client_tls_config(&self) -> rustls::ClientConfig {
        culvert_common::load_client_config_from_pem(
            &self.certs.client_cert_pem,
            &self.certs.client_key_pem,
            &self.certs.ca_cert_pem,
        )
        .expect("Failed to load client TLS config")
    }

    /// Get the Host header value for a routing key
    pub fn host_for(&self, routing_key: &str) -> String {
        format!("{}.{}", routing_key, self.base_domain)
    }

    /// Shutdown the test server
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
