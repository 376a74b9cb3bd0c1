//! Client configuration file (TOML), merged with CLI flags by the binary.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Client configuration (parsed from TOML; every field optional so CLI flags
/// can fill the gaps)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server address (host:port)
    pub server_addr: Option<String>,

    /// Local service address to forward to
    pub local_addr: Option<String>,

    /// Requested routing key / subdomain (None = server assigns one)
    pub routing_key: Option<String>,

    /// Shared token expected by the server
    pub auth_token: Option<String>,

    /// Client certificate PEM path
    pub cert_path: Option<PathBuf>,

    /// Client private key PEM path
    pub key_path: Option<PathBuf>,

    /// CA certificate PEM path used to verify the server
    pub ca_cert_path: Option<PathBuf>,

    /// Seconds between health probes
    pub health_interval_secs: Option<u64>,

    /// Seconds without an ack before the server is considered unhealthy
    pub probe_timeout_secs: Option<u64>,

    /// Additional seconds of silence before giving up and reconnecting
    pub grace_period_secs: Option<u64>,
}

impl ClientConfig {
    /// Load configuration from a TOML file; missing or broken files resolve
    /// to defaults so the CLI flags alone can drive the client.
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }
}
