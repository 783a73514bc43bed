//! Configuration types for volstore
//!
//! The object server reads these from a TOML file; every section and field
//! has a default so a partial (or missing) file is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration for volstore
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Object server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load a configuration file, falling back to defaults when it is absent
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations the server cannot start with
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for device in &self.storage.devices {
            if device.name.is_empty() {
                return Err(Error::Configuration("device name must not be empty".into()));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "device {} configured more than once",
                    device.name
                )));
            }
        }
        Ok(())
    }
}

/// Object server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the object server listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Largest request body accepted for PUT (default: 5 GiB)
    #[serde(default = "default_max_object_size")]
    pub max_object_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_object_size: default_max_object_size(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6000))
}

fn default_max_object_size() -> usize {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Devices served by this node
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Reserve space for the declared content length before writing
    #[serde(default = "default_preallocate")]
    pub preallocate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            preallocate: default_preallocate(),
        }
    }
}

fn default_preallocate() -> bool {
    true
}

/// Configuration for a single device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier used in request paths
    pub name: String,
    /// Mount point of the device's volume
    pub path: PathBuf,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
