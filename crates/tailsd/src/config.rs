//! Configuration file parsing and structures.
//!
//! tailsd uses a single TOML file. Every section is optional; a missing section falls back
//! to the defaults below, so an empty file is a valid (simulator-less, API-less) config.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub timing: TimingConfig,
    pub discovery: DiscoveryConfig,
    pub events: EventsConfig,
    pub api: Option<ApiConfig>,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"tailsd::router" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

fn default_devices_path() -> PathBuf {
    PathBuf::from("devices.json")
}

/// Where the device list is persisted
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_devices_path")]
    pub devices_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            devices_path: default_devices_path(),
        }
    }
}

/// Timing knobs for the connection lifecycle, all in milliseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Upper bound on one connect attempt (including write target discovery)
    pub connect_timeout_ms: u64,

    /// Pause between a failed connect and the next attempt
    pub retry_delay_ms: u64,

    /// Period of the keep-alive write while connected
    pub heartbeat_interval_ms: u64,

    /// Upper bound on a single write
    pub write_timeout_ms: u64,

    /// Period of the fleet supervisor's registry scan
    pub poll_interval_ms: u64,

    /// Upper bound on a discovery scan
    pub scan_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            retry_delay_ms: 5_000,
            heartbeat_interval_ms: 2_000,
            write_timeout_ms: 1_000,
            poll_interval_ms: 3_000,
            scan_timeout_ms: 10_000,
        }
    }
}

/// Resolved timings handed to supervisors and the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
    pub poll_interval: Duration,
    pub scan_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        TimingConfig::default().timings()
    }
}

impl TimingConfig {
    pub fn timings(&self) -> Timings {
        Timings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
        }
    }

    fn validate(&self) -> Result<(), String> {
        let fields = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("retry_delay_ms", self.retry_delay_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("scan_timeout_ms", self.scan_timeout_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(format!("timing.{} must be greater than zero", name));
            }
        }
        Ok(())
    }
}

fn default_device_name() -> String {
    "TouchyTails".to_string()
}

/// Discovery configuration
#[derive(Debug, Deserialize)]
pub struct DiscoveryConfig {
    /// Advertised local name a peripheral must carry to be adopted
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Run one discovery pass when the daemon starts
    #[serde(default)]
    pub scan_on_start: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            scan_on_start: false,
        }
    }
}

/// Event source configuration
#[derive(Debug, Default, Deserialize)]
pub struct EventsConfig {
    /// MQTT event source, disabled when absent
    #[serde(default)]
    pub mqtt: Option<MqttSourceConfig>,

    /// OSC (UDP) event source, disabled when absent
    #[serde(default)]
    pub osc: Option<OscSourceConfig>,
}

fn default_osc_port() -> u16 {
    9001
}

fn default_address_prefix() -> String {
    "/avatar/parameters/".to_string()
}

/// OSC event source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OscSourceConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_osc_port")]
    pub port: u16,

    /// Messages to `<address_prefix><event name>` become events
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "tailsd".to_string()
}

fn default_topic_prefix() -> String {
    "tails/events".to_string()
}

/// MQTT event source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSourceConfig {
    /// MQTT broker hostname or IP address
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Events arrive on `<topic_prefix>/<event name>`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8577
}

/// HTTP control API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Peripherals served by the built-in simulated transport
#[derive(Debug, Default, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub peripherals: Vec<SimulatedPeripheral>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedPeripheral {
    pub address: String,
    #[serde(default = "default_device_name")]
    pub name: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        Self::from_source(path, &contents)
    }

    /// Parse and validate configuration text that came from `path`
    pub fn from_source(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.message().to_string(),
            span: e.span(),
            content: contents.to_string(),
        })?;

        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), String> {
        self.timing.validate()?;

        if self.discovery.device_name.trim().is_empty() {
            return Err("discovery.device_name must not be empty".to_string());
        }

        if let Some(mqtt) = &self.events.mqtt {
            if mqtt.topic_prefix.contains(['+', '#']) {
                return Err(format!(
                    "events.mqtt.topic_prefix '{}' must not contain wildcards",
                    mqtt.topic_prefix
                ));
            }
        }

        if let Some(osc) = &self.events.osc {
            if !osc.address_prefix.starts_with('/') {
                return Err(format!(
                    "events.osc.address_prefix '{}' must start with '/'",
                    osc.address_prefix
                ));
            }
        }

        for peripheral in &self.simulator.peripherals {
            if let Err(e) = crate::device::parse_device_id(&peripheral.address) {
                return Err(format!(
                    "simulator.peripherals address '{}' is not a device address: {}",
                    peripheral.address, e
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse {}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        message: String,
        span: Option<Range<usize>>,
        content: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config = Config::from_source(Path::new("empty.toml"), "").unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.storage.devices_path, PathBuf::from("devices.json"));
        assert_eq!(config.discovery.device_name, "TouchyTails");
        assert!(config.api.is_none());
        assert!(config.events.mqtt.is_none());

        let timings = config.timing.timings();
        assert_eq!(timings.connect_timeout, Duration::from_secs(10));
        assert_eq!(timings.retry_delay, Duration::from_secs(5));
        assert_eq!(timings.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(timings.write_timeout, Duration::from_secs(1));
        assert_eq!(timings.poll_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "debug"

            [logging.overrides]
            "tailsd::router" = "trace"

            [storage]
            devices_path = "/var/lib/tailsd/devices.json"

            [timing]
            heartbeat_interval_ms = 500

            [discovery]
            device_name = "Tail"
            scan_on_start = true

            [events.mqtt]
            broker = "localhost"
            username = "tails"

            [events.osc]
            port = 9100

            [api]
            port = 9000

            [[simulator.peripherals]]
            address = "AA:BB:CC:DD:EE:01"
        "#;

        let config = Config::from_source(Path::new("full.toml"), toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.logging.overrides.get("tailsd::router"),
            Some(&LogLevel::Trace)
        );
        assert_eq!(config.timing.heartbeat_interval_ms, 500);
        assert_eq!(config.timing.retry_delay_ms, 5_000);
        assert!(config.discovery.scan_on_start);

        let mqtt = config.events.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.topic_prefix, "tails/events");
        assert_eq!(mqtt.username.as_deref(), Some("tails"));

        let osc = config.events.osc.as_ref().unwrap();
        assert_eq!(osc.listen, "127.0.0.1");
        assert_eq!(osc.port, 9100);
        assert_eq!(osc.address_prefix, "/avatar/parameters/");

        let api = config.api.as_ref().unwrap();
        assert_eq!(api.listen, "127.0.0.1");
        assert_eq!(api.port, 9000);

        assert_eq!(config.simulator.peripherals.len(), 1);
        assert_eq!(config.simulator.peripherals[0].name, "TouchyTails");
    }

    #[test]
    fn test_zero_timing_rejected() {
        let toml = r#"
            [timing]
            write_timeout_ms = 0
        "#;

        let err = Config::from_source(Path::new("bad.toml"), toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("write_timeout_ms")));
    }

    #[test]
    fn test_simulated_peripheral_address_checked() {
        let toml = r#"
            [[simulator.peripherals]]
            address = "aa-bb-cc-dd-ee-01"

            [[simulator.peripherals]]
            address = "left tail"
        "#;

        let err = Config::from_source(Path::new("bad.toml"), toml).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid(ref m) if m.contains("'left tail' is not a device address"))
        );
    }

    #[test]
    fn test_parse_error_keeps_span() {
        let toml = "[timing]\nretry_delay_ms = \"soon\"\n";

        match Config::from_source(Path::new("bad.toml"), toml) {
            Err(ConfigError::Parse { span, content, .. }) => {
                let span = span.expect("toml reports a span for type errors");
                assert!(content[span].contains("soon"));
            }
            other => panic!("expected parse error, got {:?}", other.map(|_| ())),
        }
    }
}
