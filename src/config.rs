//! Client configuration
//!
//! Loaded from JSON (or built in code) and validated once. A configuration
//! that names a service it does not define is a setup bug and is rejected
//! here, before any session exists.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::address::DeviceAddress;
use crate::services::{RouteRule, ServiceEntry, ServiceMap};
use crate::stream::adapter::ReadTimeout;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No services configured")]
    NoServices,

    #[error("Route or default refers to unknown service {0:?}")]
    UnknownService(String),

    #[error("Route for service {0:?} has an empty marker")]
    EmptyMarker(String),

    #[error("Route for service {0:?} has a marker offset out of range")]
    MarkerOutOfRange(String),
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_disconnect_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    4_000
}

/// Everything needed to talk to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub address: DeviceAddress,

    /// Budget for scanning plus connecting.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Budget for characteristic reads and notify (un)subscription.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Stream read budget; `0` waits until the requested bytes arrive.
    #[serde(default)]
    pub read_timeout_ms: u64,

    pub services: BTreeMap<String, ServiceEntry>,

    #[serde(default)]
    pub routes: Vec<RouteRule>,

    pub default_service: String,
}

impl ClientConfig {
    /// The built-in service table and timeouts for the device at `address`.
    pub fn default_for(address: DeviceAddress) -> Self {
        let builtin = ServiceMap::builtin();
        Self {
            address,
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            read_timeout_ms: 0,
            services: builtin
                .iter()
                .map(|(name, entry)| (name.to_string(), *entry))
                .collect(),
            routes: builtin.routes().to_vec(),
            default_service: builtin.default_service().to_string(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        if !self.services.contains_key(&self.default_service) {
            return Err(ConfigError::UnknownService(self.default_service.clone()));
        }
        for route in &self.routes {
            if !self.services.contains_key(&route.service) {
                return Err(ConfigError::UnknownService(route.service.clone()));
            }
            if route.marker.is_empty() {
                return Err(ConfigError::EmptyMarker(route.service.clone()));
            }
            if route.marker_end().is_none() {
                return Err(ConfigError::MarkerOutOfRange(route.service.clone()));
            }
        }
        Ok(())
    }

    pub fn service_map(&self) -> ServiceMap {
        ServiceMap::new(
            self.services.clone(),
            self.routes.clone(),
            self.default_service.clone(),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn read_timeout(&self) -> ReadTimeout {
        ReadTimeout::from_millis(self.read_timeout_ms)
    }
}
