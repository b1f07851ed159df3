/*!
 * Configuration management for PanelSync.
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * `PANELSYNC__SECTION__KEY` environment variables. A reload is announced to
 * the rest of the process with a [`SettingsChanged`] event.
 */
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::LightingConfig;

/// Environment variable prefix used by [`Config::load`]
pub const ENV_PREFIX: &str = "PANELSYNC";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device handling
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Power event handling
    #[serde(default)]
    pub power: PowerConfig,

    /// Broker connection
    #[serde(default)]
    pub mqtt: BrokerSettings,

    /// Topic layout on the broker
    #[serde(default)]
    pub topics: TopicsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Device handling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Capacity of each device's outbound command queue
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    /// Enumerate attached hardware once at startup
    #[serde(default = "default_true")]
    pub rescan_on_start: bool,

    /// Per-serial lighting applied when a device connects
    #[serde(default)]
    pub profiles: Vec<LightingProfile>,
}

/// Stored lighting for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingProfile {
    /// Device serial number
    pub serial: String,
    /// Lighting to apply
    pub lighting: LightingConfig,
}

/// Which power event source to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerSourceKind {
    /// Pick the source that matches the host platform
    #[default]
    Auto,
    /// Tail the login manager and systemd journal
    Linux,
    /// Do not watch for power events
    Disabled,
}

/// Power event configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Power event source
    #[serde(default)]
    pub source: PowerSourceKind,

    /// Wait after resume before rescanning hardware
    #[serde(default = "default_resume_settle_ms")]
    pub resume_settle_ms: u64,

    /// Wait after the rescan before restoring lighting
    #[serde(default = "default_reconnect_settle_ms")]
    pub reconnect_settle_ms: u64,

    /// Interval between queue drain checks on shutdown
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,

    /// Number of queue drain checks before giving up
    #[serde(default = "default_drain_poll_attempts")]
    pub drain_poll_attempts: u32,

    /// Primary signal stream command
    #[serde(default = "default_primary_command")]
    pub primary_command: Vec<String>,

    /// Fallback journal stream command
    #[serde(default = "default_fallback_command")]
    pub fallback_command: Vec<String>,
}

impl PowerConfig {
    /// Delay between resume and rescan
    pub fn resume_settle(&self) -> Duration {
        Duration::from_millis(self.resume_settle_ms)
    }

    /// Delay between rescan and lighting restore
    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    /// Interval between drain checks
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

/// Broker connection settings
///
/// Two values compare equal when every field matches; applying settings equal
/// to the active ones does nothing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Whether a broker connection is wanted at all
    #[serde(default)]
    pub enabled: bool,

    /// Broker host name
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// User name, empty for anonymous access
    #[serde(default)]
    pub username: String,

    /// Password
    #[serde(default)]
    pub password: String,

    /// Use TLS
    #[serde(default)]
    pub secure: bool,
}

impl BrokerSettings {
    /// The "no active connection" sentinel
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            secure: false,
        }
    }

    /// Whether credentials should be sent
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: String::new(),
            password: String::new(),
            secure: false,
        }
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("secure", &self.secure)
            .finish()
    }
}

/// Topic layout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicsConfig {
    /// Prefix for every topic
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// Rate-limit window for non-immediate publishes
    #[serde(default = "default_publish_window_ms")]
    pub publish_window_ms: u64,
}

impl TopicsConfig {
    /// Rate-limit window
    pub fn publish_window(&self) -> Duration {
        Duration::from_millis(self.publish_window_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: default_command_queue_capacity(),
            rescan_on_start: true,
            profiles: Vec::new(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            source: PowerSourceKind::Auto,
            resume_settle_ms: default_resume_settle_ms(),
            reconnect_settle_ms: default_reconnect_settle_ms(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            drain_poll_attempts: default_drain_poll_attempts(),
            primary_command: default_primary_command(),
            fallback_command: default_fallback_command(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            base_topic: default_base_topic(),
            publish_window_ms: default_publish_window_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_command_queue_capacity() -> usize {
    32
}

fn default_resume_settle_ms() -> u64 {
    2000
}

fn default_reconnect_settle_ms() -> u64 {
    1000
}

fn default_drain_poll_interval_ms() -> u64 {
    100
}

fn default_drain_poll_attempts() -> u32 {
    20
}

fn default_primary_command() -> Vec<String> {
    vec![
        "dbus-monitor".to_string(),
        "--system".to_string(),
        "interface='org.freedesktop.login1.Manager',member='PrepareForSleep'".to_string(),
    ]
}

fn default_fallback_command() -> Vec<String> {
    vec![
        "journalctl".to_string(),
        "-f".to_string(),
        "--no-pager".to_string(),
        "_SYSTEMD_UNIT=systemd-suspend.service".to_string(),
        "_SYSTEMD_UNIT=systemd-hybrid-sleep.service".to_string(),
        "_SYSTEMD_UNIT=systemd-hibernate.service".to_string(),
    ]
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_base_topic() -> String {
    "panelsync".to_string()
}

fn default_publish_window_ms() -> u64 {
    250
}

impl Config {
    /// Load from an optional file plus `PANELSYNC__*` environment variables
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = ConfigBuilder::new().with_environment_prefix(ENV_PREFIX);
        if let Some(path) = path {
            builder = builder.with_config_file(path);
        }
        builder.build()
    }

    /// Check values that deserialize fine but cannot work
    pub fn validate(&self) -> Result<()> {
        if self.devices.command_queue_capacity == 0 {
            return Err(Error::config("devices.command_queue_capacity must be at least 1"));
        }
        if self.power.primary_command.is_empty() || self.power.fallback_command.is_empty() {
            return Err(Error::config("power commands must name a program"));
        }
        if self.mqtt.enabled && (self.mqtt.host.is_empty() || self.mqtt.port == 0) {
            return Err(Error::config("mqtt.host and mqtt.port are required when mqtt is enabled"));
        }
        if self.topics.base_topic.is_empty()
            || self.topics.base_topic.contains(['#', '+'])
        {
            return Err(Error::config("topics.base_topic must be a plain, non-empty topic"));
        }
        Ok(())
    }

    /// Stored lighting for a serial, if any
    pub fn lighting_for(&self, serial: &str) -> Option<&LightingConfig> {
        self.devices
            .profiles
            .iter()
            .find(|p| p.serial == serial)
            .map(|p| &p.lighting)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
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

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
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

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

/// Published on the event bus whenever configuration is (re)loaded
#[derive(Debug, Clone)]
pub struct SettingsChanged {
    /// The new configuration
    pub config: SharedConfig,
    /// When it was loaded
    pub loaded_at: DateTime<Utc>,
}

impl SettingsChanged {
    /// Announce a freshly loaded configuration
    pub fn new(config: impl Into<SharedConfig>) -> Self {
        Self {
            config: config.into(),
            loaded_at: Utc::now(),
        }
    }
}
