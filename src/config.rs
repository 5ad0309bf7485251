//! # Connector Configuration
//!
//! Connection parameters, the printer profile used to build motion and
//! temperature commands, and logging options.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [connection]
//! host = "192.168.1.50"
//! serial = "01S00C123456789"
//! access_code = "12345678"
//!
//! [profile.axes]
//! x = 6000.0
//! y = 6000.0
//! z = 200.0
//! e = 300.0
//!
//! [profile.extruder]
//! count = 1
//! shared_nozzle = false
//!
//! [logging]
//! level = "debug"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::ToSocketAddrs;
use std::path::Path;
use thiserror::Error;

use crate::error::ConnectorError;

/// Port the device's telemetry broker listens on; used for host resolution.
pub const DEVICE_PORT: u16 = 8883;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub connection: ConnectionParameters,
    #[serde(default)]
    pub profile: PrinterProfile,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where and how to reach the device. Immutable once a connector holds it.
#[derive(Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ConnectionParameters {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub access_code: String,
}

impl ConnectionParameters {
    pub fn new(host: impl Into<String>, serial: impl Into<String>, access_code: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            serial: serial.into(),
            access_code: access_code.into(),
        }
    }

    /// Checks everything that can be checked before touching the device.
    /// Empty fields are rejected before the host is resolved.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.host.trim().is_empty() {
            return Err(ConnectorError::Preconditions("host is empty".to_string()));
        }
        if self.serial.is_empty() {
            return Err(ConnectorError::Preconditions("serial is empty".to_string()));
        }
        if self.access_code.is_empty() {
            return Err(ConnectorError::Preconditions("access code is empty".to_string()));
        }
        let resolved = (self.host.as_str(), DEVICE_PORT)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false);
        if !resolved {
            return Err(ConnectorError::Preconditions(format!(
                "host '{}' does not resolve",
                self.host
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("host", &self.host)
            .field("serial", &self.serial)
            .field("access_code", &!self.access_code.is_empty())
            .finish()
    }
}

/// Printer profile values the command templates depend on.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrinterProfile {
    #[serde(default)]
    pub axes: AxisSpeeds,
    #[serde(default)]
    pub extruder: ExtruderProfile,
}

/// Maximum feed rate per axis, mm/min.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxisSpeeds {
    #[serde(default = "default_xy_speed")]
    pub x: f64,
    #[serde(default = "default_xy_speed")]
    pub y: f64,
    #[serde(default = "default_z_speed")]
    pub z: f64,
    #[serde(default = "default_e_speed")]
    pub e: f64,
}

impl Default for AxisSpeeds {
    fn default() -> Self {
        Self {
            x: default_xy_speed(),
            y: default_xy_speed(),
            z: default_z_speed(),
            e: default_e_speed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtruderProfile {
    #[serde(default = "default_extruder_count")]
    pub count: u32,
    #[serde(default)]
    pub shared_nozzle: bool,
}

impl Default for ExtruderProfile {
    fn default() -> Self {
        Self {
            count: default_extruder_count(),
            shared_nozzle: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
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

impl LoggingConfig {
    pub fn max_level(&self) -> Result<tracing::Level, ConfigError> {
        self.level.parse().map_err(|_| ConfigError::Invalid {
            field: "logging.level",
            reason: format!("unknown level '{}'", self.level),
        })
    }
}

fn default_xy_speed() -> f64 {
    6000.0
}

fn default_z_speed() -> f64 {
    200.0
}

fn default_e_speed() -> f64 {
    300.0
}

fn default_extruder_count() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PrinterProfile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, speed) in [
            ("profile.axes.x", self.axes.x),
            ("profile.axes.y", self.axes.y),
            ("profile.axes.z", self.axes.z),
            ("profile.axes.e", self.axes.e),
        ] {
            if !speed.is_finite() || speed <= 0.0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("speed must be positive, got {}", speed),
                });
            }
        }
        if self.extruder.count == 0 {
            return Err(ConfigError::Invalid {
                field: "profile.extruder.count",
                reason: "at least one extruder is required".to_string(),
            });
        }
        Ok(())
    }
}

pub fn parse_config(toml_str: &str) -> Result<ConnectorConfig, ConfigError> {
    let config: ConnectorConfig = toml::from_str(toml_str)?;
    config.profile.validate()?;
    config.logging.max_level()?;
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<ConnectorConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}
