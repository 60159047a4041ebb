//! Bus configuration.
//!
//! Configuration can be built in code or loaded from YAML files and
//! environment variables.

use std::time::Duration;

use serde::Deserialize;

pub use crate::queue::QueueConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "relaybus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAYBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAYBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAYBUS_LOG";

/// Default subscriber cache lifetime: five minutes.
pub const DEFAULT_SUBSCRIBER_TTL_MS: u64 = 5 * 60 * 1000;
/// Default capacity of the bus-wide error stream.
pub const DEFAULT_ERROR_BUFFER: usize = 256;

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// Settings for one bus instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Queue backend settings; `queue.prefix` identifies this bus instance.
    pub queue: QueueConfig,
    /// Subscriber list cache lifetime in milliseconds. 0 disables caching.
    pub subscriber_ttl_ms: u64,
    /// Bus-wide error stream capacity. Errors beyond it are dropped.
    pub error_buffer: usize,
    /// Decoded messages buffered per subscription stream.
    pub stream_buffer: usize,
    /// Upper bound on waiting for Unsubscribe/Close teardown.
    pub close_timeout_ms: Option<u64>,
    /// Also deliver this instance's own publications to its own endpoint.
    pub echo: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            subscriber_ttl_ms: DEFAULT_SUBSCRIBER_TTL_MS,
            error_buffer: DEFAULT_ERROR_BUFFER,
            stream_buffer: 1,
            close_timeout_ms: None,
            echo: false,
        }
    }
}

impl BusConfig {
    /// Config for a bus instance with the given endpoint prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            queue: QueueConfig::with_prefix(prefix),
            ..Self::default()
        }
    }

    /// Set the subscriber cache lifetime.
    pub fn subscriber_ttl(mut self, ttl: Duration) -> Self {
        self.subscriber_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the teardown timeout.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Deliver own publications back to this instance.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn subscriber_ttl_duration(&self) -> Duration {
        Duration::from_millis(self.subscriber_ttl_ms)
    }

    pub fn close_timeout_duration(&self) -> Option<Duration> {
        self.close_timeout_ms.map(Duration::from_millis)
    }

    /// Check required settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.prefix.is_empty() {
            return Err(ConfigError::Missing("queue.prefix"));
        }
        Ok(())
    }
}

/// Discovery registry settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Registry key prefix. Must be identical on every node of a pub/sub network.
    pub prefix: String,
    pub delimiter: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            prefix: "relaybus-discovery".to_string(),
            delimiter: ":".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `relaybus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    ///    (e.g. `RELAYBUS__BUS__SUBSCRIBER_TTL_MS=0`)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.bus.validate()?;
        Ok(config)
    }
}
