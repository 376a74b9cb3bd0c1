use thiserror::Error;

/// Common errors for tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No tunnel registered for '{0}'")]
    NotFound(String),

    #[error("Routing key already taken: {0}")]
    RoutingKeyTaken(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Exchange timed out")]
    Timeout,

    #[error("Transport lost: {0}")]
    Transport(String),

    #[error("Local service unreachable: {0}")]
    LocalUnreachable(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),
}

/// Why an individual exchange stopped without delivering a normal response.
///
/// Callers use this to distinguish "your request failed" from "the tunnel is
/// gone": the first two leave the session standing, the rest mean every
/// in-flight exchange on the session failed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeFailure {
    /// Deadline passed before the response completed.
    TimedOut,
    /// The peer could not reach its local service.
    LocalUnreachable,
    /// The session was closed (health expiry, explicit close, disconnect).
    SessionClosed,
    /// The session was pushed out of the registry.
    SessionEvicted,
    /// The transport dropped mid-exchange.
    TransportLost,
}

impl std::fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExchangeFailure::TimedOut => "exchange timed out",
            ExchangeFailure::LocalUnreachable => "local service unreachable",
            ExchangeFailure::SessionClosed => "session closed",
            ExchangeFailure::SessionEvicted => "session evicted",
            ExchangeFailure::TransportLost => "transport lost",
        };
        f.write_str(s)
    }
}
