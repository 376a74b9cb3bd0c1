//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (CULVERT_*)
//! 2. Config file (server.toml)
//! 3. Default values (where applicable)

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "CULVERT";

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the control plane (mTLS tunnel client connections)
    pub control_port: Option<u16>,

    /// Port for the public HTTP plane
    pub http_port: Option<u16>,

    /// Base domain for tunnels (e.g., "tunnel.example.com")
    pub base_domain: Option<String>,

    /// Server certificate PEM path
    pub cert_path: Option<PathBuf>,

    /// Server private key PEM path
    pub key_path: Option<PathBuf>,

    /// CA certificate PEM path used to verify tunnel clients
    pub ca_cert_path: Option<PathBuf>,

    /// Shared token tunnel clients must present at registration
    pub auth_token: Option<String>,

    /// Maximum number of simultaneously registered tunnels
    pub registry_capacity: Option<usize>,

    /// Seconds between health probes
    pub health_interval_secs: Option<u64>,

    /// Seconds without an ack before a session is unhealthy
    pub probe_timeout_secs: Option<u64>,

    /// Additional seconds of silence before an unhealthy session is closed
    pub grace_period_secs: Option<u64>,

    /// Seconds a public request may wait on its tunnel exchange
    pub exchange_timeout_secs: Option<u64>,
}

/// Fully-validated server configuration
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub control_port: u16,
    pub http_port: u16,
    pub base_domain: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub auth_token: Option<String>,
    pub registry_capacity: usize,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
    pub exchange_timeout: Duration,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn get_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
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

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        let control_port = get_env_parsed("CONTROL_PORT")
            .or(self.control_port)
            .unwrap_or(4443);

        let http_port = get_env_parsed("HTTP_PORT").or(self.http_port).unwrap_or(8080);

        let base_domain = get_env("BASE_DOMAIN").or(self.base_domain).ok_or_else(|| {
            anyhow::anyhow!("Base domain required. Set CULVERT_BASE_DOMAIN or base_domain in config")
        })?;

        let cert_path = get_env("CERT_PATH")
            .map(PathBuf::from)
            .or(self.cert_path)
            .ok_or_else(|| {
                anyhow::anyhow!("Certificate required. Set CULVERT_CERT_PATH or cert_path in config")
            })?;

        let key_path = get_env("KEY_PATH")
            .map(PathBuf::from)
            .or(self.key_path)
            .ok_or_else(|| {
                anyhow::anyhow!("Private key required. Set CULVERT_KEY_PATH or key_path in config")
            })?;

        let ca_cert_path = get_env("CA_CERT_PATH")
            .map(PathBuf::from)
            .or(self.ca_cert_path)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "CA certificate required. Set CULVERT_CA_CERT_PATH or ca_cert_path in config"
                )
            })?;

        let auth_token = get_env("AUTH_TOKEN").or(self.auth_token);

        let registry_capacity = get_env_parsed("REGISTRY_CAPACITY")
            .or(self.registry_capacity)
            .unwrap_or(1024);
        if registry_capacity == 0 {
            anyhow::bail!("registry_capacity must be at least 1");
        }

        let health_interval = Duration::from_secs(
            get_env_parsed("HEALTH_INTERVAL_SECS")
                .or(self.health_interval_secs)
                .unwrap_or(15),
        );
        let probe_timeout = Duration::from_secs(
            get_env_parsed("PROBE_TIMEOUT_SECS")
                .or(self.probe_timeout_secs)
                .unwrap_or(20),
        );
        let grace_period = Duration::from_secs(
            get_env_parsed("GRACE_PERIOD_SECS")
                .or(self.grace_period_secs)
                .unwrap_or(40),
        );
        let exchange_timeout = Duration::from_secs(
            get_env_parsed("EXCHANGE_TIMEOUT_SECS")
                .or(self.exchange_timeout_secs)
                .unwrap_or(30),
        );

        Ok(ResolvedServerConfig {
            control_port,
            http_port,
            base_domain,
            cert_path,
            key_path,
            ca_cert_path,
            auth_token,
            registry_capacity,
            health_interval,
            probe_timeout,
            grace_period,
            exchange_timeout,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_require_only_domain_and_tls_material() {
        let config: ServerConfig = toml::from_str(
            r#"
            base_domain = "tunnel.example.com"
            cert_path = "server.pem"
            key_path = "server.key"
            ca_cert_path = "ca.pem"
            "#,
        )
        .unwrap();

        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.control_port, 4443);
        assert_eq!(resolved.http_port, 8080);
        assert_eq!(resolved.registry_capacity, 1024);
        assert_eq!(resolved.exchange_timeout, Duration::from_secs(30));
        assert!(resolved.auth_token.is_none());
    }

    #[test]
    fn missing_base_domain_is_an_error() {
        let config: ServerConfig = toml::from_str(
            r#"
            cert_path = "server.pem"
            key_path = "server.key"
            ca_cert_path = "ca.pem"
            "#,
        )
        .unwrap();
        assert!(config.resolve().is_err());
    }

    #[test]
    fn zero_capacity_rejected() {
        let config: ServerConfig = toml::from_str(
            r#"
            base_domain = "t.example.com"
            cert_path = "server.pem"
            key_path = "server.key"
            ca_cert_path = "ca.pem"
            registry_capacity = 0
            "#,
        )
        .unwrap();
        assert!(config.resolve().is_err());
    }
}
