//! Client-side session: the tunnel's other half.
//!
//! `establish` runs the Init/InitAck handshake; `run` then multiplexes
//! inbound exchanges onto forwarder tasks, answers health probes, runs its
//! own probes, and honors suspend/resume requested through the controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_rustls::client::TlsStream;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use culvert_common::{HealthMonitor, HealthState};
use culvert_protocol::{CloseReason, CodecError, Frame, FrameCodec, FrameType};

use crate::forwarder::{InboundChunk, LocalForwarder};

/// How long the handshake may take before giving up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Session parameters supplied by configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Requested routing key; `None` lets the server assign one.
    pub routing_key: Option<String>,
    /// Shared token expected by the server, if any.
    pub auth_token: Option<String>,
    /// Local service address requests are forwarded to.
    pub local_addr: String,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
}

impl SessionConfig {
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            routing_key: None,
            auth_token: None,
            local_addr: local_addr.into(),
            health_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(20),
            grace_period: Duration::from_secs(40),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The server refused registration; retrying will not help.
    #[error("tunnel rejected: {0}")]
    Rejected(CloseReason),

    /// The server closed an established session.
    #[error("server closed session: {0}")]
    ClosedByServer(CloseReason),

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("health probes unacknowledged past grace period")]
    HealthExpired,

    #[error("server disconnected")]
    Disconnected,

    #[error("handshake timed out")]
    HandshakeTimeout,
}

impl SessionError {
    /// Fatal errors should stop the reconnect loop: the server told us the
    /// registration itself is unacceptable, or someone else owns the key now.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Rejected(_) => true,
            SessionError::ClosedByServer(reason) => matches!(
                reason,
                CloseReason::AuthFailed | CloseReason::RoutingKeyTaken | CloseReason::Superseded
            ),
            _ => false,
        }
    }
}

/// Commands consumed by the session's write task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    PauseWrites,
    ResumeWrites,
    Shutdown,
}

/// Clonable handle for driving an established session from outside.
#[derive(Clone)]
pub struct SessionController {
    outbound: mpsc::Sender<Outbound>,
}

impl SessionController {
    /// Park the session: tells the server to queue dispatches and parks our
    /// own exchange traffic until `resume`.
    pub async fn suspend(&self) -> Result<(), SessionError> {
        self.send(Outbound::Frame(Frame::suspend())).await?;
        self.send(Outbound::PauseWrites).await
    }

    /// Unpark: flushes queued traffic on both sides.
    pub async fn resume(&self) -> Result<(), SessionError> {
        self.send(Outbound::Frame(Frame::resume())).await?;
        self.send(Outbound::ResumeWrites).await
    }

    /// Cleanly close the tunnel.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.send(Outbound::Shutdown).await
    }

    async fn send(&self, cmd: Outbound) -> Result<(), SessionError> {
        self.outbound
            .send(cmd)
            .await
            .map_err(|_| SessionError::Disconnected)
    }
}

/// An established tunnel session, ready to run.
pub struct TunnelSession {
    read_half: ReadHalf<TlsStream<TcpStream>>,
    write_half: WriteHalf<TlsStream<TcpStream>>,
    codec: FrameCodec,
    read_buf: BytesMut,
    routing_key: String,
    session_token: Uuid,
    config: SessionConfig,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
}

/// Run the registration handshake over a connected TLS stream.
pub async fn establish(
    tls_stream: TlsStream<TcpStream>,
    config: SessionConfig,
) -> Result<TunnelSession, SessionError> {
    let (mut read_half, mut write_half) = tokio::io::split(tls_stream);

    let mut codec = FrameCodec::new();
    let mut read_buf = BytesMut::with_capacity(8192);

    let init = Frame::init(
        config.routing_key.as_deref().unwrap_or(""),
        config.auth_token.as_deref(),
    );
    write_frame(&mut write_half, &mut codec, init).await?;
    tracing::debug!("Sent tunnel request");

    let reply = match timeout(
        HANDSHAKE_TIMEOUT,
        read_frame(&mut read_half, &mut codec, &mut read_buf),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(SessionError::HandshakeTimeout),
    };

    let reply = reply.ok_or(SessionError::Disconnected)?;
    match reply.frame_type {
        FrameType::InitAck => {
            let (session_token, routing_key) = reply.decode_init_ack()?;
            tracing::info!(
                routing_key = %routing_key,
                session = %session_token,
                "Tunnel established"
            );

            let (outbound_tx, outbound_rx) = mpsc::channel(256);
            Ok(TunnelSession {
                read_half,
                write_half,
                codec,
                read_buf,
                routing_key,
                session_token,
                config,
                outbound_tx,
                outbound_rx,
            })
        }
        FrameType::Close => {
            let (reason, detail) = reply.decode_close()?;
            tracing::error!(%reason, detail = %detail, "Tunnel rejected");
            Err(SessionError::Rejected(reason))
        }
        other => {
            tracing::error!("Unexpected {:?} frame during handshake", other);
            Err(SessionError::Protocol(CodecError::MalformedPayload(
                "handshake",
            )))
        }
    }
}

impl TunnelSession {
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn session_token(&self) -> Uuid {
        self.session_token
    }

    pub fn controller(&self) -> SessionController {
        SessionController {
            outbound: self.outbound_tx.clone(),
        }
    }

    /// Process the session until it ends. Returns `Ok(())` only on a clean,
    /// locally-requested or server-normal shutdown.
    pub async fn run(self) -> Result<(), SessionError> {
        let TunnelSession {
            mut read_half,
            write_half,
            mut codec,
            mut read_buf,
            routing_key,
            config,
            outbound_tx,
            outbound_rx,
            ..
        } = self;

        let monitor = Arc::new(Mutex::new({
            let mut m = HealthMonitor::new(config.probe_timeout, config.grace_period);
            m.activate(Instant::now());
            m
        }));
        let shutdown_requested = Arc::new(AtomicBool::new(false));

        let write_handle = tokio::spawn(run_write_task(
            outbound_rx,
            write_half,
            monitor.clone(),
            shutdown_requested.clone(),
        ));
        let probe_handle = tokio::spawn(run_probe_task(
            outbound_tx.clone(),
            monitor.clone(),
            config.health_interval,
        ));

        // In-flight inbound exchanges, keyed by exchange id. Each one is a
        // forwarder task fed request chunks through its channel.
        let inflight: DashMap<u64, mpsc::UnboundedSender<InboundChunk>> = DashMap::new();
        let forwarder = LocalForwarder::new(config.local_addr.clone());

        let mut health_check = tokio::time::interval(config.health_interval);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            // Handle everything already buffered (the handshake may have
            // over-read) before waiting for more bytes.
            match drain_frames(
                &mut codec,
                &mut read_buf,
                &inflight,
                &forwarder,
                &outbound_tx,
                &monitor,
            )
            .await
            {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    break if matches!(reason, CloseReason::Normal | CloseReason::Shutdown) {
                        Ok(())
                    } else {
                        Err(SessionError::ClosedByServer(reason))
                    };
                }
                Err(e) => break Err(e),
            }

            tokio::select! {
                _ = health_check.tick() => {
                    if monitor.lock().state() == HealthState::Closed {
                        tracing::error!(routing_key = %routing_key, "Server stopped answering probes");
                        break Err(SessionError::HealthExpired);
                    }
                }
                read = read_half.read_buf(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            if shutdown_requested.load(Ordering::Acquire) {
                                break Ok(());
                            }
                            tracing::info!("Server disconnected");
                            break Err(SessionError::Disconnected);
                        }
                        Ok(_) => {}
                        Err(e) => break Err(SessionError::Transport(e)),
                    }
                }
            }
        };

        // Tear down: forwarder channels close without an End marker, so
        // half-received requests are abandoned rather than forwarded.
        drop(inflight);
        probe_handle.abort();
        drop(outbound_tx);
        if timeout(Duration::from_secs(1), write_handle).await.is_err() {
            tracing::debug!("Write task did not drain in time");
        }

        result
    }
}

/// Decode and handle everything buffered. Returns `Some(reason)` when the
/// server closed the session.
async fn drain_frames(
    codec: &mut FrameCodec,
    read_buf: &mut BytesMut,
    inflight: &DashMap<u64, mpsc::UnboundedSender<InboundChunk>>,
    forwarder: &LocalForwarder,
    outbound_tx: &mpsc::Sender<Outbound>,
    monitor: &Arc<Mutex<HealthMonitor>>,
) -> Result<Option<CloseReason>, SessionError> {
    loop {
        let frame = match codec.decode(read_buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => return Err(SessionError::Protocol(e)),
        };

        match frame.frame_type {
            FrameType::ExchangeData => {
                let exchange_id = frame.exchange_id;
                if let Some(entry) = inflight.get(&exchange_id) {
                    if entry.send(InboundChunk::Data(frame.payload)).is_err() {
                        drop(entry);
                        inflight.remove(&exchange_id);
                    }
                } else {
                    // First chunk of a new exchange: spawn its forwarder.
                    let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
                    let _ = chunks_tx.send(InboundChunk::Data(frame.payload));
                    inflight.insert(exchange_id, chunks_tx);

                    let forwarder = forwarder.clone();
                    let outbound = outbound_tx.clone();
                    tokio::spawn(async move {
                        forwarder.run_exchange(exchange_id, chunks_rx, outbound).await;
                    });
                }
            }
            FrameType::ExchangeEnd => {
                // Request side complete; the forwarder sees End and replies.
                if let Some((_, chunks)) = inflight.remove(&frame.exchange_id) {
                    let _ = chunks.send(InboundChunk::End);
                } else {
                    tracing::debug!(
                        exchange_id = frame.exchange_id,
                        "End frame for unknown exchange"
                    );
                }
            }
            FrameType::Health => {
                let seq = frame.decode_health()?;
                let _ = outbound_tx
                    .send(Outbound::Frame(Frame::health_ack(seq)))
                    .await;
            }
            FrameType::HealthAck => {
                frame.decode_health()?;
                monitor.lock().record_ack(Instant::now());
            }
            FrameType::Close => {
                let (reason, detail) = frame.decode_close()?;
                tracing::info!(%reason, detail = %detail, "Server closed session");
                return Ok(Some(reason));
            }
            FrameType::Suspend | FrameType::Resume => {
                tracing::debug!("Ignoring unexpected {:?} from server", frame.frame_type);
            }
            FrameType::Init | FrameType::InitAck => {
                return Err(SessionError::Protocol(CodecError::MalformedPayload(
                    "handshake frame on established session",
                )));
            }
        }
    }
}

/// Write task: owns the encoder and the suspend queue. Mirrors the server's
/// semantics: exchange frames park while suspended, control frames pass.
async fn run_write_task<W: AsyncWrite + Unpin>(
    mut rx: mpsc::Receiver<Outbound>,
    mut write_half: W,
    monitor: Arc<Mutex<HealthMonitor>>,
    shutdown_requested: Arc<AtomicBool>,
) {
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
            Outbound::PauseWrites => {
                suspended = true;
                monitor.lock().suspend();
            }
            Outbound::ResumeWrites => {
                suspended = false;
                monitor.lock().resume(Instant::now());
                for frame in parked.drain(..) {
                    if write_encoded(&mut write_half, &mut codec, &mut write_buf, frame)
                        .await
                        .is_err()
                    {
                        break 'outer;
                    }
                }
            }
            Outbound::Shutdown => {
                shutdown_requested.store(true, Ordering::Release);
                let _ = write_encoded(
                    &mut write_half,
                    &mut codec,
                    &mut write_buf,
                    Frame::close(CloseReason::Normal, "client shutdown"),
                )
                .await;
                break;
            }
        }
    }

    // Send TLS close_notify for graceful shutdown
    let _ = write_half.shutdown().await;
}

/// Probe task: periodic Health frames toward the server. Escalation happens
/// in the monitor; the session loop reacts to the `Closed` state.
async fn run_probe_task(
    outbound: mpsc::Sender<Outbound>,
    monitor: Arc<Mutex<HealthMonitor>>,
    interval: Duration,
) {
    let mut sequence: u64 = 0;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let state = monitor.lock().state();
        if state == HealthState::Suspended {
            continue;
        }
        if state == HealthState::Closed {
            return;
        }

        sequence += 1;
        if outbound
            .send(Outbound::Frame(Frame::health(sequence)))
            .await
            .is_err()
        {
            return;
        }

        match monitor.lock().tick(Instant::now()) {
            HealthState::Closed => return,
            HealthState::Unhealthy => {
                tracing::warn!("No health ack from server within probe timeout");
            }
            _ => {}
        }
    }
}

async fn read_frame<R: AsyncRead + Unpin>(
    read_half: &mut R,
    codec: &mut FrameCodec,
    read_buf: &mut BytesMut,
) -> Result<Option<Frame>, SessionError> {
    loop {
        if let Some(frame) = codec.decode(read_buf)? {
            return Ok(Some(frame));
        }
        if read_half.read_buf(read_buf).await? == 0 {
            return Ok(None);
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    write_half: &mut W,
    codec: &mut FrameCodec,
    frame: Frame,
) -> Result<(), SessionError> {
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
