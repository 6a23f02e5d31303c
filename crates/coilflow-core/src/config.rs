/*!
 * Configuration management for CoilFlow.
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * environment variables (`COILFLOW__BRIDGE__POLL_INTERVAL_MS=250`).
 */
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level configuration for CoilFlow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Polling and control timing, address banks and storage locations
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Connection profile used when nothing has been persisted yet
    #[serde(default)]
    pub link: LinkConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Directory that relative storage paths are resolved against
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, `coilflow_engine=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Bridge timing and layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Status poll period
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay between the assert and de-assert writes of a momentary pulse
    #[serde(default = "default_pulse_duration_ms")]
    pub pulse_duration_ms: u64,

    /// Upper bound for a single transport request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Wait between opening a transport and the canary read
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Wait between automatic reconnection attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// First address of the status bank
    #[serde(default)]
    pub status_start: u16,

    /// First address of the control bank
    #[serde(default = "default_control_start")]
    pub control_start: u16,

    /// Where the last successful connection profile is stored, relative to `general.data_dir`
    #[serde(default = "default_profile_path")]
    pub profile_path: String,

    /// Append-only change history file, relative to `general.data_dir`; empty disables it
    #[serde(default = "default_change_log_path")]
    pub change_log_path: String,

    /// Buffer size of the live event broadcast channel and the change log queue
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Default connection profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// `network` or `serial`
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Network host
    #[serde(default = "default_host")]
    pub host: String,

    /// Network port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Serial device path
    #[serde(default = "default_device")]
    pub device: String,

    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Protocol unit (slave) address
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

impl BridgeConfig {
    /// Poll period as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pulse width as a [`Duration`]
    pub fn pulse_duration(&self) -> Duration {
        Duration::from_millis(self.pulse_duration_ms)
    }

    /// Request timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Settle period as a [`Duration`]
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Reconnect backoff as a [`Duration`]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            pulse_duration_ms: default_pulse_duration_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            settle_ms: default_settle_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            status_start: 0,
            control_start: default_control_start(),
            profile_path: default_profile_path(),
            change_log_path: default_change_log_path(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            device: default_device(),
            baud_rate: default_baud_rate(),
            unit_id: default_unit_id(),
        }
    }
}

fn default_app_name() -> String {
    "coilflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_pulse_duration_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_settle_ms() -> u64 {
    1_000
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

fn default_control_start() -> u16 {
    0x10
}

fn default_profile_path() -> String {
    "plc-connection.json".to_string()
}

fn default_change_log_path() -> String {
    "device-usage.jsonl".to_string()
}

fn default_event_capacity() -> usize {
    256
}

fn default_protocol() -> String {
    "network".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    502
}

fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_unit_id() -> u8 {
    1
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&Config::default())
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

impl Config {
    /// Location of the persisted connection profile
    pub fn profile_path(&self) -> PathBuf {
        self.in_data_dir(&self.bridge.profile_path)
    }

    /// Location of the change history, if one is kept
    pub fn change_log_path(&self) -> Option<PathBuf> {
        if self.bridge.change_log_path.is_empty() {
            None
        } else {
            Some(self.in_data_dir(&self.bridge.change_log_path))
        }
    }

    // Joining an absolute path replaces the base
    fn in_data_dir(&self, path: &str) -> PathBuf {
        Path::new(&self.general.data_dir).join(path)
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        let bridge = &self.bridge;
        if bridge.poll_interval_ms == 0 {
            return Err(Error::config("bridge.poll_interval_ms must be greater than zero"));
        }
        if bridge.request_timeout_ms == 0 {
            return Err(Error::config("bridge.request_timeout_ms must be greater than zero"));
        }
        if bridge.event_capacity == 0 {
            return Err(Error::config("bridge.event_capacity must be greater than zero"));
        }
        match self.link.protocol.as_str() {
            "network" | "serial" => Ok(()),
            other => Err(Error::config(format!(
                "link.protocol must be 'network' or 'serial', got '{}'",
                other
            ))),
        }
    }
}
