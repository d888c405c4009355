//! API server configuration

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: SocketAddr,
    /// Browser origins allowed to call the payment routes
    pub allowed_origins: Vec<String>,
    /// Run the status poller inside the API process instead of the worker
    pub run_poller_in_process: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let raw_bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_address = raw_bind.parse().map_err(|_| ConfigError::Invalid {
            key: "BIND_ADDR",
            value: raw_bind.clone(),
        })?;

        let allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();

        let raw_poller =
            std::env::var("PAYMENT_POLLER_IN_PROCESS").unwrap_or_else(|_| "false".to_string());
        let run_poller_in_process = raw_poller.parse().map_err(|_| ConfigError::Invalid {
            key: "PAYMENT_POLLER_IN_PROCESS",
            value: raw_poller.clone(),
        })?;

        Ok(Self {
            database_url,
            bind_address,
            allowed_origins,
            run_poller_in_process,
        })
    }
}
