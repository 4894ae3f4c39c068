//! Process settings for the simulator.
//!
//! These cover where the services listen and how the bridge retries. The
//! broker and topic mapping live in the device configuration document
//! instead (see [`crate::store`]), because the web form edits them at runtime.

use dimmsim_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::bridge::BridgeOptions;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] dimmsim_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete simulator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Modbus TCP server settings
    #[serde(default)]
    pub modbus: ModbusServerConfig,

    /// Identity responder settings
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Configuration web form settings
    #[serde(default)]
    pub web: WebConfig,

    /// Device configuration document
    #[serde(default)]
    pub store: StoreConfig,

    /// MQTT bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus TCP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusServerConfig {
    /// Socket address to bind (default: "0.0.0.0:8899")
    #[serde(default = "default_modbus_listen")]
    pub listen: String,
}

fn default_modbus_listen() -> String {
    "0.0.0.0:8899".to_string()
}

impl Default for ModbusServerConfig {
    fn default() -> Self {
        Self {
            listen: default_modbus_listen(),
        }
    }
}

/// Identity responder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Socket address to bind (default: "0.0.0.0:8898")
    #[serde(default = "default_identity_listen")]
    pub listen: String,
}

fn default_identity_listen() -> String {
    "0.0.0.0:8898".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            listen: default_identity_listen(),
        }
    }
}

/// Configuration web form settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebConfig {
    /// Socket address to bind (default: "0.0.0.0:5555")
    #[serde(default = "default_web_listen")]
    pub listen: String,
}

fn default_web_listen() -> String {
    "0.0.0.0:5555".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_web_listen(),
        }
    }
}

/// Device configuration document settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the JSON document (default: "DuCK_config.json")
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("DuCK_config.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// MQTT bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Seconds to wait after a failed connection (default: 10)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// MQTT keep-alive in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Seconds to wait for the broker to accept a connection (default: 30)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Client id prefix (default: "openwb-sim")
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_client_id_prefix() -> String {
    "openwb-sim".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

impl BridgeConfig {
    /// Bridge options derived from these settings.
    pub fn options(&self) -> BridgeOptions {
        BridgeOptions {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            client_id_prefix: self.client_id_prefix.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SimulatorConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: SimulatorConfig = dimmsim_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.reconnect_delay_secs == 0 {
            return Err(ConfigError::Validation(
                "bridge.reconnect_delay_secs must be at least 1".to_string(),
            ));
        }

        if self.bridge.keep_alive_secs == 0 {
            return Err(ConfigError::Validation(
                "bridge.keep_alive_secs must be at least 1".to_string(),
            ));
        }

        if self.bridge.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "bridge.connect_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "store.path cannot be empty".to_string(),
            ));
        }

        for (name, listen) in [
            ("modbus", &self.modbus.listen),
            ("identity", &self.identity.listen),
            ("web", &self.web.listen),
        ] {
            if listen.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{}.listen cannot be empty",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dimmsim_common::{LogFormat, parse_config};

    #[test]
    fn test_defaults() {
        let config: SimulatorConfig = parse_config("{}").unwrap();
        config.validate().unwrap();

        assert_eq!(config.modbus.listen, "0.0.0.0:8899");
        assert_eq!(config.identity.listen, "0.0.0.0:8898");
        assert_eq!(config.web.listen, "0.0.0.0:5555");
        assert_eq!(config.store.path, PathBuf::from("DuCK_config.json"));
        assert_eq!(config.bridge.reconnect_delay_secs, 10);
        assert_eq!(config.logging.level, "info");

        let options = config.bridge.options();
        assert_eq!(options.reconnect_delay, Duration::from_secs(10));
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert_eq!(options.client_id_prefix, "openwb-sim");
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            modbus: { listen: "127.0.0.1:1502" },
            web: { listen: "127.0.0.1:8080" },
            store: { path: "/var/lib/dimmsim/device.json" },
            bridge: { reconnect_delay_secs: 3, client_id_prefix: "lab-sim" },
            logging: { level: "debug", format: "json" },
        }"#;

        let config: SimulatorConfig = parse_config(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.modbus.listen, "127.0.0.1:1502");
        assert_eq!(config.identity.listen, "0.0.0.0:8898"); // default
        assert_eq!(config.web.listen, "127.0.0.1:8080");
        assert_eq!(config.bridge.options().reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.bridge.keep_alive_secs, 60);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validate_zero_delay() {
        let config: SimulatorConfig =
            parse_config("{ bridge: { reconnect_delay_secs: 0 } }").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_zero_connect_timeout() {
        let config: SimulatorConfig =
            parse_config("{ bridge: { connect_timeout_secs: 0 } }").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(msg)) if msg.contains("connect_timeout")));
    }

    #[test]
    fn test_validate_empty_listen() {
        let config: SimulatorConfig = parse_config(r#"{ web: { listen: "" } }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = SimulatorConfig::load_from_file("/nonexistent/dimmsim.json5");
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
