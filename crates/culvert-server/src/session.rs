//! Server-side session: one client's tunnel and its in-flight exchanges.
//!
//! A session is shared between the connection's read task, its write task,
//! the health/sweeper tasks and any number of HTTP plane handlers. All
//! cross-task communication goes through the outbound command channel and
//! per-exchange event channels; the in-flight map is only touched through the
//! methods here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use culvert_common::{ExchangeFailure, HealthMonitor, HealthState};
use culvert_protocol::{CloseReason, ExchangeStatus, Frame};

/// Commands consumed by a session's write task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Park exchange frames until `ResumeWrites`; control frames still pass.
    PauseWrites,
    /// Flush parked frames and resume normal writing.
    ResumeWrites,
    /// Write a `Close` frame and stop.
    Shutdown(CloseReason, String),
}

/// Events delivered to whoever dispatched an exchange.
///
/// The first `Data` chunk of a response carries its encoded head; everything
/// after is body. Exactly one `End` or `Failed` terminates the stream.
#[derive(Debug)]
pub enum ExchangeEvent {
    Data(Bytes),
    End {
        status: ExchangeStatus,
        detail: String,
    },
    Failed(ExchangeFailure),
}

#[derive(Debug, Error)]
#[error("session closed")]
pub struct SessionClosedError;

struct InflightExchange {
    events: mpsc::UnboundedSender<ExchangeEvent>,
    deadline: Instant,
}

/// One client's logical tunnel on the server.
pub struct Session {
    token: Uuid,
    routing_key: String,
    outbound: mpsc::Sender<Outbound>,
    inflight: DashMap<u64, InflightExchange>,
    next_exchange_id: AtomicU64,
    health: Mutex<HealthMonitor>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        routing_key: String,
        outbound: mpsc::Sender<Outbound>,
        probe_timeout: std::time::Duration,
        grace_period: std::time::Duration,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            token: Uuid::new_v4(),
            routing_key,
            outbound,
            inflight: DashMap::new(),
            next_exchange_id: AtomicU64::new(1),
            health: Mutex::new(HealthMonitor::new(probe_timeout, grace_period)),
            closed,
        })
    }

    /// Opaque session token issued at registration.
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn health_state(&self) -> HealthState {
        self.health.lock().state()
    }

    pub fn is_suspended(&self) -> bool {
        self.health_state() == HealthState::Suspended
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Watch that flips to `true` when the session closes.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Handshake completed; start the health clock.
    pub fn activate(&self) {
        self.health.lock().activate(Instant::now());
    }

    pub fn set_suspended(&self, suspended: bool) {
        let mut health = self.health.lock();
        if suspended {
            health.suspend();
        } else {
            health.resume(Instant::now());
        }
    }

    pub fn record_health_ack(&self) {
        self.health.lock().record_ack(Instant::now());
    }

    /// Re-evaluate liveness; returns the resulting state.
    pub fn tick_health(&self, now: Instant) -> HealthState {
        self.health.lock().tick(now)
    }

    /// Start a new exchange: allocate an id, record it as pending and emit
    /// the head frame. Returns immediately; resolution arrives on the event
    /// receiver.
    pub async fn dispatch(
        &self,
        head: Bytes,
        deadline: Instant,
    ) -> Result<(u64, mpsc::UnboundedReceiver<ExchangeEvent>), SessionClosedError> {
        if self.is_closed() {
            return Err(SessionClosedError);
        }

        let exchange_id = self.next_exchange_id.fetch_add(1, Ordering::Relaxed);
        let (events, events_rx) = mpsc::unbounded_channel();
        self.inflight
            .insert(exchange_id, InflightExchange { events, deadline });

        if self
            .outbound
            .send(Outbound::Frame(Frame::data(exchange_id, head)))
            .await
            .is_err()
        {
            self.inflight.remove(&exchange_id);
            return Err(SessionClosedError);
        }

        Ok((exchange_id, events_rx))
    }

    /// Stream one request body chunk for a dispatched exchange.
    pub async fn send_chunk(&self, exchange_id: u64, chunk: Bytes) -> Result<(), SessionClosedError> {
        self.outbound
            .send(Outbound::Frame(Frame::data(exchange_id, chunk)))
            .await
            .map_err(|_| SessionClosedError)
    }

    /// Mark the request side of an exchange complete.
    pub async fn finish(&self, exchange_id: u64) -> Result<(), SessionClosedError> {
        self.outbound
            .send(Outbound::Frame(Frame::end(
                exchange_id,
                ExchangeStatus::Ok,
                "",
            )))
            .await
            .map_err(|_| SessionClosedError)
    }

    /// Queue a control frame for the write task (probes, acks).
    pub async fn send_frame(&self, frame: Frame) -> Result<(), SessionClosedError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| SessionClosedError)
    }

    /// Queue a write-task command (suspend/resume bookkeeping).
    pub(crate) async fn send_command(&self, command: Outbound) -> Result<(), SessionClosedError> {
        self.outbound
            .send(command)
            .await
            .map_err(|_| SessionClosedError)
    }

    /// Response chunk arrived from the client. Frames for unknown (late or
    /// already-terminal) exchanges are discarded.
    pub fn on_exchange_data(&self, exchange_id: u64, payload: Bytes) {
        let Some(entry) = self.inflight.get(&exchange_id) else {
            tracing::debug!(
                exchange_id,
                "Discarding data frame for unknown exchange (late or cancelled)"
            );
            return;
        };
        if entry.events.send(ExchangeEvent::Data(payload)).is_err() {
            // The dispatcher is gone; stop correlating this exchange.
            drop(entry);
            self.inflight.remove(&exchange_id);
        }
    }

    /// Response finished. Completes the exchange; duplicates are discarded.
    pub fn on_exchange_end(&self, exchange_id: u64, status: ExchangeStatus, detail: String) {
        let Some((_, entry)) = self.inflight.remove(&exchange_id) else {
            tracing::debug!(
                exchange_id,
                "Discarding end frame for unknown exchange (late or duplicate)"
            );
            return;
        };
        let _ = entry.events.send(ExchangeEvent::End { status, detail });
    }

    /// Fail one exchange with a reason; true if it was still pending.
    pub fn fail_exchange(&self, exchange_id: u64, failure: ExchangeFailure) -> bool {
        match self.inflight.remove(&exchange_id) {
            Some((_, entry)) => {
                let _ = entry.events.send(ExchangeEvent::Failed(failure));
                true
            }
            None => false,
        }
    }

    /// Time out every exchange whose deadline has passed. Returns how many.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .inflight
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for exchange_id in expired {
            if self.fail_exchange(exchange_id, ExchangeFailure::TimedOut) {
                tracing::debug!(exchange_id, "Exchange deadline expired");
                failed += 1;
            }
        }
        failed
    }

    /// Fail all in-flight exchanges at once.
    pub fn fail_all(&self, failure: ExchangeFailure) {
        let ids: Vec<u64> = self.inflight.iter().map(|e| *e.key()).collect();
        for exchange_id in ids {
            self.fail_exchange(exchange_id, failure);
        }
    }

    /// Terminate the session. Idempotent; the first call wins.
    ///
    /// Fails every in-flight exchange with a reason derived from `reason`,
    /// asks the write task to emit a `Close` frame, and flips the closed
    /// watch so the connection tasks unwind.
    pub fn close(&self, reason: CloseReason, detail: &str) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }

        self.health.lock().close();

        let failure = match reason {
            CloseReason::Superseded | CloseReason::Evicted => ExchangeFailure::SessionEvicted,
            _ => ExchangeFailure::SessionClosed,
        };
        self.fail_all(failure);

        let _ = self
            .outbound
            .try_send(Outbound::Shutdown(reason, detail.to_string()));

        tracing::info!(
            routing_key = %self.routing_key,
            session = %self.token,
            %reason,
            "Session closed"
        );
        true
    }

    /// Number of in-flight exchanges, for tests and introspection.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }
}

// TODO: per-exchange flow-control window so a stalled public reader cannot
// buffer an arbitrarily large response in the event channel.
