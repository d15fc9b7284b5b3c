//! Gateway configuration
//!
//! Priority, lowest first:
//! 1. built-in defaults
//! 2. config file (YAML, or JSON including the legacy flat `modbus-ip` /
//!    `modbus-port` form)
//! 3. environment variables `SUNSPEC_HOST`, `SUNSPEC_PORT`, `SUNSPEC_UNIT_ID`
//!
//! The inverter host is not validated here. An empty host surfaces as a
//! configuration error on every connect attempt, which the acquisition loop
//! retries like any other failure.

use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::acquisition::PollSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::transport::TcpConnection;
use crate::utils::validation::validate_unit_id;

pub const ENV_HOST: &str = "SUNSPEC_HOST";
pub const ENV_PORT: &str = "SUNSPEC_PORT";
pub const ENV_UNIT_ID: &str = "SUNSPEC_UNIT_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub inverter: InverterConfig,
    pub polling: PollingConfig,
}

/// Inverter endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: crate::DEFAULT_TCP_PORT,
            unit_id: crate::DEFAULT_UNIT_ID,
        }
    }
}

/// Loop and socket timings, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub io_timeout_ms: u64,
    /// Hex dump of every frame at info level
    pub packet_logging: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: crate::POLL_INTERVAL_MS,
            reconnect_delay_ms: crate::RECONNECT_DELAY_MS,
            io_timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            packet_logging: false,
        }
    }
}

/// Flat key/value form written by the original device firmware
#[derive(Debug, Deserialize)]
struct LegacyConfig {
    #[serde(rename = "modbus-ip", default)]
    host: String,
    #[serde(rename = "modbus-port", default)]
    port: Option<LegacyPort>,
}

/// The firmware stores the port as a string; accept numbers too
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyPort {
    Number(u16),
    Text(String),
}

impl GatewayConfig {
    /// Load from a file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let mut config = match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&content)?,
            "json" => Self::from_json_str(&content)?,
            other => {
                return Err(GatewayError::configuration(format!(
                    "Unsupported config file extension '{}'",
                    other
                )))
            }
        };

        config.apply_env_overrides();
        validate_unit_id(config.inverter.unit_id)?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse the nested layout, or the flat legacy keys when present
    pub fn from_json_str(content: &str) -> GatewayResult<Self> {
        let value: serde_json::Value = serde_json::from_str(content)?;

        let is_legacy = value
            .as_object()
            .map(|map| map.contains_key("modbus-ip") || map.contains_key("modbus-port"))
            .unwrap_or(false);

        if !is_legacy {
            return Ok(serde_json::from_value(value)?);
        }

        debug!("Reading legacy flat configuration keys");
        let legacy: LegacyConfig = serde_json::from_value(value)?;
        let mut config = Self::default();
        config.inverter.host = legacy.host;
        config.inverter.port = match legacy.port {
            Some(LegacyPort::Number(port)) => port,
            Some(LegacyPort::Text(text)) if text.trim().is_empty() => crate::DEFAULT_TCP_PORT,
            Some(LegacyPort::Text(text)) => text.trim().parse().map_err(|_| {
                GatewayError::configuration(format!("Invalid modbus-port '{}'", text))
            })?,
            None => crate::DEFAULT_TCP_PORT,
        };
        Ok(config)
    }

    /// Apply `SUNSPEC_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `SUNSPEC_*` overrides from any key/value source
    ///
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                ENV_HOST => {
                    debug!("{} overrides inverter host", ENV_HOST);
                    self.inverter.host = value.to_string();
                }
                ENV_PORT => match value.parse() {
                    Ok(port) => self.inverter.port = port,
                    Err(_) => warn!("Ignoring {}='{}': not a port number", ENV_PORT, value),
                },
                ENV_UNIT_ID => match value.parse() {
                    Ok(unit_id) if validate_unit_id(unit_id).is_ok() => {
                        self.inverter.unit_id = unit_id
                    }
                    _ => warn!("Ignoring {}='{}': not a unit id", ENV_UNIT_ID, value),
                },
                _ => {}
            }
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.polling.interval_ms),
            reconnect_delay: Duration::from_millis(self.polling.reconnect_delay_ms),
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.polling.io_timeout_ms)
    }

    /// Closed TCP connection to the configured inverter
    pub fn connection(&self) -> TcpConnection {
        TcpConnection::with_packet_logging(
            self.inverter.host.clone(),
            self.inverter.port,
            self.io_timeout(),
            self.polling.packet_logging,
        )
    }
}
