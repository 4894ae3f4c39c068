//! Persisted device configuration: broker endpoint, credentials and the
//! topic to discrete-input mapping.
//!
//! The document is re-read on every [`ConfigProvider::load`] call. Nothing is
//! cached, so edits saved by the web form reach the bridge the next time it
//! consults the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Configuration store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access configuration document '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse configuration document '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize configuration document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Device configuration document.
///
/// Field names on disk match the documents written by earlier versions of
/// the simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// MQTT broker host name or IP address
    #[serde(rename = "MQTT_BROKER", default)]
    pub broker_address: String,

    /// MQTT broker port (default: 1883)
    #[serde(rename = "MQTT_PORT", default = "default_broker_port")]
    pub broker_port: u16,

    /// Broker user name (empty for anonymous)
    #[serde(rename = "MQTT_USER", default)]
    pub user: String,

    /// Broker password
    #[serde(rename = "MQTT_PASSWORD", default)]
    pub password: String,

    /// Topic to discrete input index
    #[serde(rename = "TOPIC_MAP", default)]
    pub topic_map: BTreeMap<String, u16>,
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let mut topic_map = BTreeMap::new();
        topic_map.insert("topic/DI1".to_string(), 0);

        Self {
            broker_address: String::new(),
            broker_port: default_broker_port(),
            user: String::new(),
            password: String::new(),
            topic_map,
        }
    }
}

impl DeviceConfig {
    /// Discrete input index mapped to `topic`, if any.
    pub fn index_for(&self, topic: &str) -> Option<u16> {
        self.topic_map.get(topic).copied()
    }

    /// Topics to subscribe to.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topic_map.keys().map(String::as_str)
    }

    /// Topic mapped to `index`, if any.
    pub fn topic_at(&self, index: u16) -> Option<&str> {
        self.topic_map
            .iter()
            .find(|(_, i)| **i == index)
            .map(|(topic, _)| topic.as_str())
    }
}

/// Source of the current device configuration.
///
/// Implementations must return the latest persisted state on every call.
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> DeviceConfig;
}

/// File-backed configuration store.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store for the document at `path`. The file need not exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, or `Ok(None)` if it does not exist.
    pub fn try_load(&self) -> Result<Option<DeviceConfig>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Persist `config`, replacing the document.
    ///
    /// Each save writes its own uniquely named sibling file and renames it
    /// into place, so concurrent readers see either the previous or the new
    /// contents, even while other saves are running.
    pub fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(config)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let io_err = |source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut file = NamedTempFile::new_in(dir).map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.as_file().sync_all().map_err(io_err)?;

        // A failed persist drops the temporary file with the error.
        file.persist(&self.path).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e.error,
        })?;

        debug!(path = %self.path.display(), topics = config.topic_map.len(), "Saved device configuration");
        Ok(())
    }
}

impl ConfigProvider for ConfigStore {
    /// Load the document, falling back to the built-in default when it is
    /// missing or unreadable.
    fn load(&self) -> DeviceConfig {
        match self.try_load() {
            Ok(Some(config)) => config,
            Ok(None) => DeviceConfig::default(),
            Err(e) => {
                warn!(error = %e, "Using default device configuration");
                DeviceConfig::default()
            }
        }
    }
}
