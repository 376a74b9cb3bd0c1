//! Test client for E2E tests
//!
//! Drives the real client crate end to end: TLS connect, handshake, and the
//! full session loop, with a controller handle for suspend/resume tests.
//! Also provides a raw protocol-level connection for tests that need a
//! misbehaving peer (e.g. one that never acknowledges health probes).

use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use culvert::session::{establish, SessionConfig, SessionController, SessionError};
use culvert_protocol::{Frame, FrameCodec, FrameType};

use crate::harness::TestServer;

/// A test tunnel client backed by the real client implementation.
pub struct TestClient {
    /// The routing key the server settled on
    pub routing_key: String,
    /// Session token issued at registration
    pub session_token: Uuid,
    controller: SessionController,
    handle: Option<tokio::task::JoinHandle<Result<(), SessionError>>>,
}

impl TestClient {
    /// Connect to the test server and establish a tunnel.
    pub async fn connect(
        server: &TestServer,
        local_addr: &str,
        routing_key: Option<&str>,
    ) -> Result<Self, SessionError> {
        let mut config = SessionConfig::new(local_addr);
        config.routing_key = routing_key.map(str::to_string);
        // Probe briskly so health-sensitive tests run quickly.
        config.health_interval = std::time::Duration::from_millis(500);
        config.probe_timeout = std::time::Duration::from_secs(2);
        config.grace_period = std::time::Duration::from_secs(4);
        Self::connect_with(server, config).await
    }

    /// Connect with a fully explicit session config.
    pub async fn connect_with(
        server: &TestServer,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let tls_stream = open_tls(server).await?;
        let session = establish(tls_stream, config).await?;

        let routing_key = session.routing_key().to_string();
        let session_token = session.session_token();
        let controller = session.controller();
        let handle = tokio::spawn(session.run());

        Ok(Self {
            routing_key,
            session_token,
            controller,
            handle: Some(handle),
        })
    }

    pub async fn suspend(&self) -> Result<(), SessionError> {
        self.controller.suspend().await
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.controller.resume().await
    }

    /// Whether the session loop is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cleanly close the tunnel and wait for the session loop to finish.
    pub async fn shutdown(mut self) -> Result<(), SessionError> {
        let _ = self.controller.close().await;
        match self.handle.take().expect("session task").await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    /// Wait for the session loop to end on its own (e.g. after eviction).
    pub async fn wait(mut self) -> Result<(), SessionError> {
        match self.handle.take().expect("session task").await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// A protocol-level connection that completed the handshake but runs no
/// session loop: it never answers probes and never services exchanges.
pub struct SilentClient {
    /// Keeps the transport open; dropping it closes the connection.
    pub stream: TlsStream<TcpStream>,
    pub routing_key: String,
    pub session_token: Uuid,
}

impl SilentClient {
    pub async fn connect(server: &TestServer, routing_key: &str) -> Result<Self> {
        let mut stream = open_tls(server).await?;

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::init(routing_key, None), &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        let mut read_buf = BytesMut::with_capacity(8192);
        loop {
            if let Some(frame) = codec.decode(&mut read_buf)? {
                match frame.frame_type {
                    FrameType::InitAck => {
                        let (session_token, routing_key) = frame.decode_init_ack()?;
                        return Ok(Self {
                            stream,
                            routing_key,
                            session_token,
                        });
                    }
                    FrameType::Close => {
                        let (reason, detail) = frame.decode_close()?;
                        anyhow::bail!("handshake rejected: {} ({})", reason, detail);
                    }
                    _ => continue,
                }
            }
            if stream.read_buf(&mut read_buf).await? == 0 {
                anyhow::bail!("server disconnected during handshake");
            }
        }
    }
}

async fn open_tls(server: &TestServer) -> std::io::Result<TlsStream<TcpStream>> {
    let tls_config = server.client_tls_config();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp_stream = TcpStream::connect(server.control_addr).await?;
    let server_name = "localhost".try_into().expect("valid server name");
    connector.connect(server_name, tcp_stream).await
}
