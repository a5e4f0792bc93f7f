//! Daemon Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/sensord.toml` (base configuration)
//! 2. Environment variables prefixed with `SENSORD_`, nested keys separated
//!    by a double underscore
//!
//! # Example
//! ```no_run
//! use sensord::config::DaemonConfig;
//!
//! let config = DaemonConfig::load()?;
//! println!("Control socket: {}", config.daemon.control_socket.display());
//! # Ok::<(), figment::Error>(())
//! ```
//!
//! `SENSORD_DAEMON__MAX_SESSIONS=8` overrides `daemon.max_sessions`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::network::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use crate::network::session::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_SESSIONS};
use crate::sensor::frame::SensorType;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/sensord.toml";

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Socket and session settings
    pub daemon: DaemonSettings,
    /// Sensors to serve
    #[serde(default)]
    pub sensors: Vec<SensorDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Sockets and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Path of the control socket
    pub control_socket: PathBuf,
    /// Directory holding per-session data sockets
    pub data_socket_dir: PathBuf,
    /// Daemon-wide cap on open sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Queue capacity for sessions that never set a buffer size
    #[serde(default = "default_buffer_size")]
    pub default_buffer_size: u32,
    /// Largest accepted control message body in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Sensor definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDefinition {
    /// Unique sensor identifier, the name clients pass to `open()`
    pub id: String,
    /// Sensor type (e.g., "accelerometer", "als")
    pub r#type: String,
    /// Whether this sensor is served
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Human readable description; the adaptor's own is used when absent
    #[serde(default)]
    pub description: Option<String>,
    /// Upper bound on the sampling rate; caps the fastest advertised interval
    #[serde(default)]
    pub sample_rate_limit_hz: Option<u32>,
}

impl SensorDefinition {
    /// Parsed sensor type.
    pub fn sensor_type(&self) -> Result<SensorType, String> {
        self.r#type.parse()
    }

    /// Shortest interval in ms allowed by `sample_rate_limit_hz`.
    pub fn min_interval_ms(&self) -> Option<u32> {
        self.sample_rate_limit_hz
            .filter(|hz| *hz > 0)
            .map(|hz| 1000u32.div_ceil(hz))
    }
}

// Default value functions
fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_buffer_size() -> u32 {
    DEFAULT_BUFFER_SIZE
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_enabled() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "sensord".to_string(),
                log_level: "info".to_string(),
            },
            daemon: DaemonSettings {
                control_socket: PathBuf::from("/tmp/sensord/control.sock"),
                data_socket_dir: PathBuf::from("/tmp/sensord/data"),
                max_sessions: default_max_sessions(),
                default_buffer_size: default_buffer_size(),
                max_message_size: default_max_message_size(),
            },
            sensors: vec![SensorDefinition {
                id: "accel".to_string(),
                r#type: "accelerometer".to_string(),
                enabled: true,
                description: None,
                sample_rate_limit_hz: None,
            }],
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `config/sensord.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, on top of the defaults
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(DaemonConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SENSORD_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.daemon.max_sessions == 0 {
            return Err("max_sessions must be at least 1".to_string());
        }
        if self.daemon.default_buffer_size == 0 {
            return Err("default_buffer_size must be at least 1".to_string());
        }
        if self.daemon.max_message_size < 64 {
            return Err(format!(
                "max_message_size {} is too small (minimum 64)",
                self.daemon.max_message_size
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for sensor in &self.sensors {
            if !ids.insert(&sensor.id) {
                return Err(format!("Duplicate sensor ID: {}", sensor.id));
            }
            sensor
                .sensor_type()
                .map_err(|e| format!("Sensor '{}': {}", sensor.id, e))?;
        }

        Ok(())
    }

    /// Render the configuration as TOML, e.g. to show the merged result of
    /// file and environment.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Get all enabled sensors
    pub fn enabled_sensors(&self) -> Vec<&SensorDefinition> {
        self.sensors.iter().filter(|s| s.enabled).collect()
    }
}
