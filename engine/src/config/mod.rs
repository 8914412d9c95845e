pub mod manager;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{operations, polling, transport};
use crate::errors::ConfigError;

pub use manager::ConfigManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_correlation_key")]
    pub correlation_key: String,
    #[serde(default)]
    pub transport: TransportSettings,
    // Populated from individual connection config files
    #[serde(skip)]
    pub connections: HashMap<String, ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_unclaimed_response_ms")]
    pub unclaimed_response_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfigFile {
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub accept_self_signed: bool,
    /// PEM file with the certificate(s) to trust when self-signed is not accepted
    #[serde(default)]
    pub trusted_certificate: Option<String>,
}

/// Timeouts handed to a transport worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub response_timeout: Duration,
    pub stop_timeout: Duration,
    pub unclaimed_timeout: Duration,
}

impl Config {
    /// Parse a main config file on its own, without connection files
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: "main.toml".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_threads".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.correlation_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "correlation_key".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::from(&self.transport)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            poll_interval_ms: default_poll_interval_ms(),
            correlation_key: default_correlation_key(),
            transport: TransportSettings::default(),
            connections: HashMap::new(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            unclaimed_response_ms: default_unclaimed_response_ms(),
        }
    }
}

impl From<&TransportSettings> for TransportConfig {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            response_timeout: Duration::from_millis(settings.response_timeout_ms),
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
            unclaimed_timeout: Duration::from_millis(settings.unclaimed_response_ms),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::from(&TransportSettings::default())
    }
}

fn default_worker_threads() -> usize {
    operations::DEFAULT_WORKER_THREADS
}

fn default_poll_interval_ms() -> u64 {
    polling::POLL_INTERVAL.as_millis() as u64
}

fn default_correlation_key() -> String {
    polling::CORRELATION_KEY.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    transport::CONNECT_TIMEOUT.as_millis() as u64
}

fn default_handshake_timeout_ms() -> u64 {
    transport::HANDSHAKE_TIMEOUT.as_millis() as u64
}

fn default_read_timeout_ms() -> u64 {
    transport::READ_TIMEOUT.as_millis() as u64
}

fn default_write_timeout_ms() -> u64 {
    transport::WRITE_TIMEOUT.as_millis() as u64
}

fn default_response_timeout_ms() -> u64 {
    transport::RESPONSE_TIMEOUT.as_millis() as u64
}

fn default_stop_timeout_ms() -> u64 {
    transport::STOP_TIMEOUT.as_millis() as u64
}

fn default_unclaimed_response_ms() -> u64 {
    transport::UNCLAIMED_RESPONSE_TIMEOUT.as_millis() as u64
}

fn default_port() -> u16 {
    transport::DEFAULT_PORT
}
