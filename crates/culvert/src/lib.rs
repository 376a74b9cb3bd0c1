//! Culvert tunnel client library.
//!
//! The binary wires this up from CLI flags and a config file; the pieces are
//! exposed as a library so the end-to-end tests can drive a real client
//! in-process.

pub mod config;
pub mod forwarder;
pub mod session;

pub use forwarder::LocalForwarder;
pub use session::{establish, SessionConfig, SessionController, SessionError, TunnelSession};
