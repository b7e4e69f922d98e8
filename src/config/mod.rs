//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::consumer::FeedConfig;
use crate::feed::KafkaConfig;
use crate::reconcile::MapsConfig;
use crate::storage::{DatabaseConfig, PersistenceConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MAPSYNC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MAPSYNC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MAPSYNC_LOG";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mark event feed consumption.
    pub feed: FeedConfig,
    /// Kafka connection, shared by the feed and the timeline producer.
    pub kafka: KafkaConfig,
    /// Persistence service client.
    pub database: DatabaseConfig,
    /// Entity cache sizing and expiry.
    pub cache: CacheConfig,
    /// Background write lanes.
    pub persistence: PersistenceConfig,
    /// Defaults for maps created on first reference.
    pub maps: MapsConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `MAPSYNC__FEED__TOPIC`
    ///
    /// `DATABASE_SERVICE_URL` and `DATABASE_AUTH_KEY` are applied last.
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

        let mut config: Config = config.try_deserialize()?;
        config.database = config.database.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse an inline YAML document. Missing sections take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.topic.is_empty() {
            return Err(ConfigError::Invalid("feed.topic must not be empty".to_string()));
        }
        if self.feed.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "feed.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if !(self.maps.default_scale.is_finite() && self.maps.default_scale > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "maps.default_scale must be positive, got {}",
                self.maps.default_scale
            )));
        }
        Ok(())
    }
}
