use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use culvert_common::HealthState;
use culvert_protocol::{CloseReason, Frame, FrameCodec, FrameType};

use crate::registry::ConnectionRegistry;
use crate::session::{Outbound, Session};

/// How long a freshly-accepted connection gets to complete the Init exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often pending exchanges are checked against their deadlines.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Per-session tunables handed to the control plane.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Shared token clients must present at registration, if set.
    pub auth_token: Option<String>,
    /// Interval between health probes.
    pub health_interval: Duration,
    /// Silence before a session is considered unhealthy.
    pub probe_timeout: Duration,
    /// Additional silence before an unhealthy session is closed.
    pub grace_period: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auth_token: None,
            health_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(20),
            grace_period: Duration::from_secs(40),
        }
    }
}

/// Control plane server that accepts tunnel client connections via mTLS.
pub struct ControlPlane {
    registry: Arc<ConnectionRegistry>,
    tls_acceptor: TlsAcceptor,
    settings: SessionSettings,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tls_acceptor: TlsAcceptor,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tls_acceptor,
            settings,
        })
    }

    /// Start listening for tunnel client connections.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Control plane listening on {}", addr);
        self.run_with_listener(listener).await
    }

    /// Accept loop over an already-bound listener (used by tests).
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = self.clone();

            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr).await {
                    tracing::error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        tracing::debug!("New connection from {}", peer_addr);

        let tls_stream = self.tls_acceptor.accept(stream).await?;
        let (mut read_half, mut write_half) = tokio::io::split(tls_stream);

        let mut codec = FrameCodec::new();
        let mut read_buf = BytesMut::with_capacity(8192);

        // Registration handshake: exactly one Init frame is expected first.
        let init = match timeout(
            HANDSHAKE_TIMEOUT,
            read_frame(&mut read_half, &mut codec, &mut read_buf),
        )
        .await
        {
            Ok(Ok(Some(frame))) if frame.frame_type == FrameType::Init => frame,
            Ok(Ok(Some(frame))) => {
                let _ = write_frame(
                    &mut write_half,
                    Frame::close(CloseReason::Protocol, "expected init frame"),
                )
                .await;
                anyhow::bail!("handshake violation: got {:?}", frame.frame_type);
            }
            Ok(Ok(None)) => anyhow::bail!("disconnected during handshake"),
            Ok(Err(e)) => return Err(e).context("handshake decode failed"),
            Err(_) => anyhow::bail!("handshake timed out"),
        };

        let (requested_key, auth_token) = init.decode_init()?;

        if let Some(expected) = &self.settings.auth_token {
            if auth_token.as_deref() != Some(expected.as_str()) {
                tracing::warn!("Rejecting {}: bad auth token", peer_addr);
                let _ = write_frame(
                    &mut write_half,
                    Frame::close(CloseReason::AuthFailed, "authentication failed"),
                )
                .await;
                return Ok(());
            }
        }

        let routing_key = if requested_key.is_empty() {
            generate_routing_key()
        } else {
            requested_key
        };

        if !is_valid_routing_key(&routing_key) {
            let _ = write_frame(
                &mut write_half,
                Frame::close(CloseReason::Protocol, "invalid routing key format"),
            )
            .await;
            anyhow::bail!("invalid routing key from {}", peer_addr);
        }

        // An actively healthy holder keeps its key; a suspended or unhealthy
        // one is presumed stale (a rejoining client) and gets superseded by
        // register() below.
        if let Some(existing) = self.registry.lookup(&routing_key) {
            if existing.health_state() == HealthState::Active {
                tracing::info!(
                    routing_key = %routing_key,
                    "Rejecting registration: key held by an active tunnel"
                );
                let _ = write_frame(
                    &mut write_half,
                    Frame::close(CloseReason::RoutingKeyTaken, &routing_key),
                )
                .await;
                return Ok(());
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(256);
        let session = Session::new(
            routing_key.clone(),
            outbound_tx,
            self.settings.probe_timeout,
            self.settings.grace_period,
        );

        write_frame(
            &mut write_half,
            Frame::init_ack(session.token(), &routing_key),
        )
        .await?;

        session.activate();
        self.registry.register(session.clone());

        tracing::info!(
            routing_key = %routing_key,
            session = %session.token(),
            peer = %peer_addr,
            "Tunnel established"
        );

        let write_handle = tokio::spawn(run_write_task(outbound_rx, write_half));
        let health_handle = tokio::spawn(run_health_task(
            session.clone(),
            self.registry.clone(),
            self.settings.health_interval,
        ));
        let sweep_handle = tokio::spawn(run_sweep_task(session.clone()));

        let result = process_frames(&session, &mut read_half, &mut codec, &mut read_buf).await;

        // Cleanup: drop the registry entry (unless a successor owns the key
        // now) and fail whatever was still in flight.
        self.registry.unregister(&routing_key, session.token());
        session.close(CloseReason::Normal, "connection closed");

        health_handle.abort();
        sweep_handle.abort();
        // Let the write task flush its Close frame before the stream drops.
        drop(session);
        if timeout(Duration::from_secs(1), write_handle).await.is_err() {
            tracing::debug!("Write task did not drain in time");
        }

        tracing::info!(routing_key = %routing_key, peer = %peer_addr, "Tunnel torn down");
        result
    }
}

/// Read loop: correlate exchange frames, answer probes, obey suspend/resume.
async fn process_frames<R: AsyncRead + Unpin>(
    session: &Arc<Session>,
    read_half: &mut R,
    codec: &mut FrameCodec,
    read_buf: &mut BytesMut,
) -> Result<()> {
    let mut closed = session.closed_watch();

    loop {
        // Drain everything already buffered (the handshake may have
        // over-read) before waiting for more bytes.
        loop {
            if *closed.borrow() {
                return Ok(());
            }
            let frame = match codec.decode(read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    // Corrupt stream: unrecoverable for this connection.
                    session.close(CloseReason::Protocol, "malformed frame");
                    return Err(e.into());
                }
            };
            if !handle_session_frame(session, frame).await? {
                return Ok(());
            }
        }

        tokio::select! {
            _ = closed.changed() => return Ok(()),
            read = read_half.read_buf(read_buf) => {
                match read {
                    Ok(0) => {
                        tracing::debug!(routing_key = session.routing_key(), "Client disconnected");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

/// Handle one established-session frame. Returns `false` when the client
/// closed the session.
async fn handle_session_frame(session: &Arc<Session>, frame: Frame) -> Result<bool> {
    match frame.frame_type {
        FrameType::Health => {
            let seq = frame.decode_health()?;
            let _ = session.send_frame(Frame::health_ack(seq)).await;
        }
        FrameType::HealthAck => {
            frame.decode_health()?;
            session.record_health_ack();
        }
        FrameType::ExchangeData => {
            session.on_exchange_data(frame.exchange_id, frame.payload);
        }
        FrameType::ExchangeEnd => {
            let (status, detail) = frame.decode_end()?;
            session.on_exchange_end(frame.exchange_id, status, detail);
        }
        FrameType::Suspend => {
            tracing::info!(routing_key = session.routing_key(), "Session suspended");
            session.set_suspended(true);
            let _ = session.send_command(Outbound::PauseWrites).await;
        }
        FrameType::Resume => {
            tracing::info!(routing_key = session.routing_key(), "Session resumed");
            session.set_suspended(false);
            let _ = session.send_command(Outbound::ResumeWrites).await;
        }
        FrameType::Close => {
            let (reason, _) = frame.decode_close()?;
            tracing::info!(
                routing_key = session.routing_key(),
                %reason,
                "Client closed session"
            );
            return Ok(false);
        }
        FrameType::Init | FrameType::InitAck => {
            session.close(CloseReason::Protocol, "unexpected handshake frame");
            anyhow::bail!("handshake frame on established session");
        }
    }
    Ok(true)
}

/// Write task: owns the encoder and the suspend queue.
///
/// While suspended, exchange frames are parked and flushed on resume; control
/// frames (health, close) always pass so liveness survives suspension.
async fn run_write_task<W: AsyncWrite + Unpin>(mut rx: mpsc::Receiver<Outbound>, mut write_half: W) {
    let mut codec = FrameCodec::new();
    let mut write_buf = BytesMut::with_capacity(8192);
    let mut parked: Vec<Frame> = Vec::new();
    let mut suspended = false;

    'outer: while let Some(cmd) = rx.recv().await {
        match cmd {
            Outbound::Frame(frame) => {
                if suspended && frame.frame_type.is_exchange() {
                    parked.push(frame);
                    continue;
                }
                if write_encoded(&mut write_half, &mut codec, &mut write_buf, frame)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Outbound::PauseWrites => suspended = true,
            Outbound::ResumeWrites => {
                suspended = false;
                for frame in parked.drain(..) {
                    if write_encoded(&mut write_half, &mut codec, &mut write_buf, frame)
                        .await
                        .is_err()
                    {
                        break 'outer;
                    }
                }
            }
            Outbound::Shutdown(reason, detail) => {
                let _ = write_encoded(
                    &mut write_half,
                    &mut codec,
                    &mut write_buf,
                    Frame::close(reason, &detail),
                )
                .await;
                break;
            }
        }
    }

    // Send TLS close_notify for graceful shutdown
    let _ = write_half.shutdown().await;
}

/// Probe task: periodic Health frames plus escalation of silent sessions.
async fn run_health_task(
    session: Arc<Session>,
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
) {
    let mut sequence: u64 = 0;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closed = session.closed_watch();

    loop {
        tokio::select! {
            _ = closed.changed() => return,
            _ = ticker.tick() => {
                if session.is_closed() {
                    return;
                }
                if session.is_suspended() {
                    continue;
                }

                sequence += 1;
                if session.send_frame(Frame::health(sequence)).await.is_err() {
                    return;
                }

                match session.tick_health(Instant::now()) {
                    HealthState::Closed => {
                        tracing::warn!(
                            routing_key = session.routing_key(),
                            "Health probes unacknowledged past grace period; closing"
                        );
                        registry.unregister(session.routing_key(), session.token());
                        session.close(CloseReason::HealthExpired, "health probes unacknowledged");
                        return;
                    }
                    HealthState::Unhealthy => {
                        tracing::debug!(routing_key = session.routing_key(), "Session unhealthy");
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Deadline sweeper: times out pending exchanges independent of transport health.
async fn run_sweep_task(session: Arc<Session>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closed = session.closed_watch();

    loop {
        tokio::select! {
            _ = closed.changed() => return,
            _ = ticker.tick() => {
                session.sweep_expired(Instant::now());
            }
        }
    }
}

/// Decode one frame, reading more bytes as needed. `None` means clean EOF.
async fn read_frame<R: AsyncRead + Unpin>(
    read_half: &mut R,
    codec: &mut FrameCodec,
    read_buf: &mut BytesMut,
) -> Result<Option<Frame>> {
    loop {
        if let Some(frame) = codec.decode(read_buf)? {
            return Ok(Some(frame));
        }
        if read_half.read_buf(read_buf).await? == 0 {
            return Ok(None);
        }
    }
}

/// Encode and write a single frame outside the write task (handshake path).
async fn write_frame<W: AsyncWrite + Unpin>(write_half: &mut W, frame: Frame) -> Result<()> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(64 + frame.payload.len());
    codec.encode(frame, &mut buf)?;
    write_half.write_all(&buf).await?;
    write_half.flush().await?;
    Ok(())
}

async fn write_encoded<W: AsyncWrite + Unpin>(
    write_half: &mut W,
    codec: &mut FrameCodec,
    write_buf: &mut BytesMut,
    frame: Frame,
) -> std::io::Result<()> {
    write_buf.clear();
    codec
        .encode(frame, write_buf)
        .map_err(std::io::Error::other)?;
    write_half.write_all(write_buf).await?;
    write_half.flush().await
}

/// Generate a random routing key (first char forced to a letter so the
/// resulting hostname label is always valid).
fn generate_routing_key() -> String {
    let id = Uuid::new_v4().to_string();
    let first = id.chars().next().unwrap();
    let prefix = if first.is_ascii_digit() {
        // Map 0-9 to a-j
        char::from(b'a' + first.to_digit(10).unwrap() as u8)
    } else {
        first
    };
    format!("{}{}", prefix, &id[1..8])
}

/// Validate routing key format (DNS label: alphanumeric and hyphens only).
fn is_valid_routing_key(key: &str) -> bool {
    if key.is_empty() || key.len() > 63 {
        return false;
    }

    let first = key.chars().next().unwrap();
    let last = key.chars().last().unwrap();
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return false;
    }

    key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_routing_keys() {
        assert!(is_valid_routing_key("myapp"));
        assert!(is_valid_routing_key("my-app"));
        assert!(is_valid_routing_key("my-app-123"));
        assert!(is_valid_routing_key("a"));
        assert!(is_valid_routing_key("123"));
    }

    #[test]
    fn invalid_routing_keys() {
        assert!(!is_valid_routing_key(""));
        assert!(!is_valid_routing_key("-myapp"));
        assert!(!is_valid_routing_key("myapp-"));
        assert!(!is_valid_routing_key("my_app"));
        assert!(!is_valid_routing_key("my.app"));
        assert!(!is_valid_routing_key(&"a".repeat(64)));
    }

    #[test]
    fn generated_keys_are_valid_hostname_labels() {
        for _ in 0..64 {
            let key = generate_routing_key();
            assert!(is_valid_routing_key(&key), "bad generated key: {}", key);
            assert!(key.chars().next().unwrap().is_ascii_alphabetic());
        }
    }
}
