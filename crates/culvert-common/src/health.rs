//! Per-session liveness tracking.
//!
//! Both peers run the same state machine: probes go out on an interval, and
//! the time since the last acknowledgment decides the state. The monitor does
//! no I/O itself — the session's probe task feeds it clock readings and acks
//! and reacts to the transitions it reports.

use std::time::{Duration, Instant};

/// Lifecycle state of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Handshake in progress; not yet routable.
    Connecting,
    Active,
    /// Parked by the client; traffic queues, probing pauses.
    Suspended,
    /// Probes unacknowledged past the probe timeout.
    Unhealthy,
    Closed,
}

/// Tracks one peer's liveness from probe acknowledgments.
#[derive(Debug)]
pub struct HealthMonitor {
    state: HealthState,
    last_ack: Instant,
    probe_timeout: Duration,
    grace_period: Duration,
}

impl HealthMonitor {
    pub fn new(probe_timeout: Duration, grace_period: Duration) -> Self {
        Self {
            state: HealthState::Connecting,
            last_ack: Instant::now(),
            probe_timeout,
            grace_period,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Handshake completed; the ack clock starts now.
    pub fn activate(&mut self, now: Instant) {
        if self.state == HealthState::Connecting {
            self.state = HealthState::Active;
            self.last_ack = now;
        }
    }

    pub fn suspend(&mut self) {
        if matches!(self.state, HealthState::Active | HealthState::Unhealthy) {
            self.state = HealthState::Suspended;
        }
    }

    /// Unpark. The ack clock resets so a long suspension does not count as
    /// missed probes.
    pub fn resume(&mut self, now: Instant) {
        if self.state == HealthState::Suspended {
            self.state = HealthState::Active;
            self.last_ack = now;
        }
    }

    /// Any acknowledgment brings an unhealthy session back to active.
    pub fn record_ack(&mut self, now: Instant) {
        self.last_ack = now;
        if self.state == HealthState::Unhealthy {
            self.state = HealthState::Active;
        }
    }

    pub fn close(&mut self) {
        self.state = HealthState::Closed;
    }

    /// Re-evaluate liveness against the clock and return the current state.
    ///
    /// Escalation only applies to `Active`/`Unhealthy` sessions: an
    /// unacknowledged probe window makes the session `Unhealthy`, and the
    /// grace period on top of it makes it `Closed`.
    pub fn tick(&mut self, now: Instant) -> HealthState {
        if matches!(self.state, HealthState::Active | HealthState::Unhealthy) {
            let silent_for = now.saturating_duration_since(self.last_ack);
            if silent_for > self.probe_timeout + self.grace_period {
                self.state = HealthState::Closed;
            } else if silent_for > self.probe_timeout {
                self.state = HealthState::Unhealthy;
            } else {
                self.state = HealthState::Active;
            }
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE: Duration = Duration::from_secs(10);
    const GRACE: Duration = Duration::from_secs(20);

    fn active_monitor(now: Instant) -> HealthMonitor {
        let mut m = HealthMonitor::new(PROBE, GRACE);
        m.activate(now);
        m
    }

    #[test]
    fn stays_active_while_acked() {
        let start = Instant::now();
        let mut m = active_monitor(start);

        m.record_ack(start + Duration::from_secs(8));
        assert_eq!(m.tick(start + Duration::from_secs(15)), HealthState::Active);
    }

    #[test]
    fn missed_probes_escalate_to_unhealthy_then_closed() {
        let start = Instant::now();
        let mut m = active_monitor(start);

        assert_eq!(m.tick(start + Duration::from_secs(11)), HealthState::Unhealthy);
        assert_eq!(m.tick(start + Duration::from_secs(29)), HealthState::Unhealthy);
        assert_eq!(m.tick(start + Duration::from_secs(31)), HealthState::Closed);
    }

    #[test]
    fn ack_recovers_unhealthy_session() {
        let start = Instant::now();
        let mut m = active_monitor(start);

        assert_eq!(m.tick(start + Duration::from_secs(12)), HealthState::Unhealthy);
        m.record_ack(start + Duration::from_secs(13));
        assert_eq!(m.state(), HealthState::Active);
        assert_eq!(m.tick(start + Duration::from_secs(14)), HealthState::Active);
    }

    #[test]
    fn suspension_pauses_escalation() {
        let start = Instant::now();
        let mut m = active_monitor(start);
        m.suspend();

        // Far past probe timeout + grace, but parked sessions are not probed.
        assert_eq!(m.tick(start + Duration::from_secs(300)), HealthState::Suspended);

        m.resume(start + Duration::from_secs(300));
        assert_eq!(m.state(), HealthState::Active);
        // The ack clock restarted at resume time.
        assert_eq!(m.tick(start + Duration::from_secs(305)), HealthState::Active);
    }

    #[test]
    fn connecting_is_not_escalated() {
        let start = Instant::now();
        let mut m = HealthMonitor::new(PROBE, GRACE);
        assert_eq!(m.tick(start + Duration::from_secs(300)), HealthState::Connecting);
    }

    #[test]
    fn closed_is_terminal() {
        let start = Instant::now();
        let mut m = active_monitor(start);
        m.close();

        m.record_ack(start + Duration::from_secs(1));
        assert_eq!(m.tick(start + Duration::from_secs(2)), HealthState::Closed);
    }
}
