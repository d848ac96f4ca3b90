//! Configuration system for switchyard
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (SWITCHYARD_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Main switchyard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    /// Broadcast log and replay service
    pub broadcast: BroadcastSettings,

    /// Resilient request channel
    pub channel: ChannelSettings,

    /// Worker dispatch router
    pub router: RouterSettings,

    /// Result aggregator
    pub aggregator: AggregatorSettings,

    /// Standalone worker runtime
    pub worker: WorkerSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Broadcast log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Address the live event stream is published on
    pub publish_addr: String,

    /// Address the replay service answers queries on
    pub replay_addr: String,

    /// Topic tag prefixed to every broadcast frame
    pub topic: String,

    /// Number of most recent events retained for replay
    pub capacity: usize,

    /// Interval of the built-in event producer (0 = disabled)
    pub publish_interval_ms: u64,

    /// Emit a gap frame when a replay starts before the retained window
    pub signal_gaps: bool,
}

/// Request channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Where `serve` accepts requests and `request` sends them
    pub endpoint: String,

    /// Per-attempt deadline (connect, send and reply) in milliseconds
    pub timeout_ms: u64,

    /// Total attempts before giving up
    pub max_retries: u32,

    /// Fixed pause between attempts in milliseconds
    pub backoff_ms: u64,
}

/// Dispatch router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Address workers connect and register on
    pub bind_addr: String,

    /// How long a dispatch waits for a first worker before failing
    pub registration_wait_ms: u64,

    /// Router housekeeping tick in milliseconds
    pub poll_interval_ms: u64,
}

/// Result aggregator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// Address workers push results to
    pub bind_addr: String,

    /// How long a dispatched request may stay unresolved
    pub pending_timeout_ms: u64,
}

/// Worker runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker index; the identity is derived from it
    pub index: u16,

    /// Exit after this long without a request
    pub idle_timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// File rotation period: hourly, daily or never
    pub rotation: String,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            publish_addr: "127.0.0.1:5556".to_string(),
            replay_addr: "127.0.0.1:5557".to_string(),
            topic: "kv".to_string(),
            capacity: 1000,
            publish_interval_ms: 50,
            signal_gaps: true,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:5555".to_string(),
            timeout_ms: 500,
            max_retries: 5,
            backoff_ms: 200,
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5560".to_string(),
            registration_wait_ms: 10_000,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5561".to_string(),
            pending_timeout_ms: 10_000,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            index: 0,
            idle_timeout_ms: 10_000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            rotation: "daily".to_string(),
            max_files: 5,
            json_format: false,
        }
    }
}

impl SwitchyardConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("switchyard.toml"),
            PathBuf::from("config.toml"),
            dirs::config_dir()
                .map(|p| p.join("switchyard").join("switchyard.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".switchyard").join("switchyard.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/switchyard/switchyard.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Broadcast
        env_override("SWITCHYARD_PUBLISH_ADDR", &mut self.broadcast.publish_addr);
        env_override("SWITCHYARD_REPLAY_ADDR", &mut self.broadcast.replay_addr);
        env_override("SWITCHYARD_TOPIC", &mut self.broadcast.topic);
        env_override("SWITCHYARD_CAPACITY", &mut self.broadcast.capacity);
        env_override("SWITCHYARD_PUBLISH_INTERVAL_MS", &mut self.broadcast.publish_interval_ms);
        env_flag("SWITCHYARD_SIGNAL_GAPS", &mut self.broadcast.signal_gaps);

        // Channel
        env_override("SWITCHYARD_CHANNEL_ENDPOINT", &mut self.channel.endpoint);
        env_override("SWITCHYARD_CHANNEL_TIMEOUT_MS", &mut self.channel.timeout_ms);
        env_override("SWITCHYARD_CHANNEL_MAX_RETRIES", &mut self.channel.max_retries);
        env_override("SWITCHYARD_CHANNEL_BACKOFF_MS", &mut self.channel.backoff_ms);

        // Router / aggregator
        env_override("SWITCHYARD_ROUTER_ADDR", &mut self.router.bind_addr);
        env_override("SWITCHYARD_REGISTRATION_WAIT_MS", &mut self.router.registration_wait_ms);
        env_override("SWITCHYARD_AGGREGATOR_ADDR", &mut self.aggregator.bind_addr);
        env_override("SWITCHYARD_PENDING_TIMEOUT_MS", &mut self.aggregator.pending_timeout_ms);

        // Worker
        env_override("SWITCHYARD_WORKER_INDEX", &mut self.worker.index);
        env_override("SWITCHYARD_WORKER_IDLE_TIMEOUT_MS", &mut self.worker.idle_timeout_ms);

        // Logging
        env_override("SWITCHYARD_LOG_LEVEL", &mut self.logging.level);
        if let Ok(val) = std::env::var("SWITCHYARD_LOG_FILE") {
            self.logging.file = Some(val);
        }
        env_flag("SWITCHYARD_LOG_JSON", &mut self.logging.json_format);
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let addrs = [
            ("broadcast.publish_addr", &self.broadcast.publish_addr),
            ("broadcast.replay_addr", &self.broadcast.replay_addr),
            ("channel.endpoint", &self.channel.endpoint),
            ("router.bind_addr", &self.router.bind_addr),
            ("aggregator.bind_addr", &self.aggregator.bind_addr),
        ];
        for (field, addr) in addrs {
            parse_addr(field, addr)?;
        }

        if self.broadcast.topic.is_empty() {
            return Err(Error::config_field_invalid("broadcast.topic", "topic cannot be empty"));
        }
        if self.broadcast.capacity == 0 {
            return Err(Error::config_field_invalid(
                "broadcast.capacity",
                "replay capacity must be at least 1",
            ));
        }
        if self.channel.max_retries == 0 {
            return Err(Error::config_field_invalid(
                "channel.max_retries",
                "at least one attempt is required",
            ));
        }

        let positive = [
            ("channel.timeout_ms", self.channel.timeout_ms),
            ("router.poll_interval_ms", self.router.poll_interval_ms),
            ("aggregator.pending_timeout_ms", self.aggregator.pending_timeout_ms),
            ("worker.idle_timeout_ms", self.worker.idle_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Error::config_field_invalid(field, "must be greater than zero"));
            }
        }

        let valid_rotations = ["hourly", "daily", "never"];
        if !valid_rotations.contains(&self.logging.rotation.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.rotation",
                format!(
                    "Invalid rotation '{}'. Must be one of: {}",
                    self.logging.rotation,
                    valid_rotations.join(", ")
                ),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

impl ChannelSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl BroadcastSettings {
    /// Producer interval, `None` when the producer is disabled
    pub fn publish_interval(&self) -> Option<Duration> {
        (self.publish_interval_ms > 0).then(|| Duration::from_millis(self.publish_interval_ms))
    }
}

/// Parse a configured address, naming the field on failure
pub fn parse_addr(field: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse().map_err(|_| {
        Error::config_field_invalid(
            field,
            format!("'{}' is not a valid socket address (host:port)", addr),
        )
    })
}

/// Overwrite `target` from an environment variable if it is set and parses
fn env_override<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(var = name, value = %val, "Ignoring unparsable environment override"),
        }
    }
}

fn env_flag(name: &str, target: &mut bool) {
    if let Ok(val) = std::env::var(name) {
        *target = val.to_lowercase() == "true" || val == "1";
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".switchyard")
                .join("switchyard.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# switchyard configuration

[broadcast]
# Live event stream address
publish_addr = "127.0.0.1:5556"

# Replay query address
replay_addr = "127.0.0.1:5557"

# Topic tag prefixed to every broadcast frame
topic = "kv"

# Number of most recent events kept for replay
capacity = 1000

# Built-in producer interval in milliseconds (0 = disabled)
publish_interval_ms = 50

# Send a gap frame when a replay starts before the retained window
signal_gaps = true

[channel]
# Request entry point of 'serve'
endpoint = "127.0.0.1:5555"

# Per-attempt deadline in milliseconds, connecting included
timeout_ms = 500

# Total attempts before giving up
max_retries = 5

# Pause between attempts in milliseconds
backoff_ms = 200

[router]
# Address workers connect to
bind_addr = "127.0.0.1:5560"

# How long a dispatch waits for the first worker (milliseconds)
registration_wait_ms = 10000

# Housekeeping tick in milliseconds
poll_interval_ms = 1000

[aggregator]
# Address workers push results to
bind_addr = "127.0.0.1:5561"

# How long a dispatched request may stay unresolved (milliseconds)
pending_timeout_ms = 10000

[worker]
# Worker index; the identity is derived from it
index = 0

# Exit after this long without a request (milliseconds)
idle_timeout_ms = 10000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.switchyard/logs/switchyard.log"

# Start a new log file: hourly, daily or never
rotation = "daily"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = SwitchyardConfig::default();
        assert_eq!(config.broadcast.capacity, 1000);
        assert_eq!(config.broadcast.topic, "kv");
        assert_eq!(config.channel.timeout(), Duration::from_millis(500));
        assert_eq!(config.channel.max_retries, 5);
        assert_eq!(config.channel.backoff(), Duration::from_millis(200));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_override() {
        env::set_var("SWITCHYARD_CHANNEL_MAX_RETRIES", "9");
        env::set_var("SWITCHYARD_TOPIC", "metrics");
        env::set_var("SWITCHYARD_CAPACITY", "not-a-number");

        let mut config = SwitchyardConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.channel.max_retries, 9);
        assert_eq!(config.broadcast.topic, "metrics");
        // Unparsable values leave the default in place
        assert_eq!(config.broadcast.capacity, 1000);

        env::remove_var("SWITCHYARD_CHANNEL_MAX_RETRIES");
        env::remove_var("SWITCHYARD_TOPIC");
        env::remove_var("SWITCHYARD_CAPACITY");
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(SwitchyardConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_bad_address() {
        let mut config = SwitchyardConfig::default();
        config.router.bind_addr = "localhost".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("localhost"));
    }

    #[test]
    fn test_validation_zero_capacity() {
        let mut config = SwitchyardConfig::default();
        config.broadcast.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_retries() {
        let mut config = SwitchyardConfig::default();
        config.channel.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = SwitchyardConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_publish_interval_disabled() {
        let mut settings = BroadcastSettings::default();
        assert_eq!(settings.publish_interval(), Some(Duration::from_millis(50)));
        settings.publish_interval_ms = 0;
        assert_eq!(settings.publish_interval(), None);
    }

    #[test]
    fn test_default_file_parses_to_defaults() {
        let parsed: SwitchyardConfig = toml::from_str(&generate_default_config()).unwrap();
        let defaults = SwitchyardConfig::default();

        assert_eq!(parsed.broadcast.replay_addr, defaults.broadcast.replay_addr);
        assert_eq!(parsed.channel.timeout_ms, defaults.channel.timeout_ms);
        assert_eq!(parsed.router.registration_wait_ms, defaults.router.registration_wait_ms);
        assert_eq!(parsed.worker.idle_timeout_ms, defaults.worker.idle_timeout_ms);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let config_str = r#"
[channel]
endpoint = "10.0.0.5:7000"
timeout_ms = 250

[logging]
level = "debug"
"#;
        let config: SwitchyardConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.channel.endpoint, "10.0.0.5:7000");
        assert_eq!(config.channel.timeout_ms, 250);
        // Unspecified values fall back to defaults
        assert_eq!(config.channel.max_retries, 5);
        assert_eq!(config.broadcast.capacity, 1000);
        assert_eq!(config.logging.level, "debug");
    }
}
