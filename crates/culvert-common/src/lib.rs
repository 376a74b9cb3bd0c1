mod error;
mod health;
mod tls;

pub use error::{ExchangeFailure, TunnelError};
pub use health::{HealthMonitor, HealthState};
pub use tls::{
    load_client_config, load_client_config_from_pem, load_server_config,
    load_server_config_from_pem,
};
