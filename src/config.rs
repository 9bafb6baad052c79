//! Service configuration for the Cortex advisor.
//!
//! Configuration is assembled from environment variables with sensible
//! defaults, validated once at startup. Pipeline definitions themselves are
//! not part of this struct; they are loaded from a YAML file and thereafter
//! from Pipeline resources (see `scheduling::reloader`).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level configuration for the Cortex service.
#[derive(Debug, Clone)]
pub struct CortexConfig {
    // HTTP settings
    /// Address the external scheduler API listens on.
    pub http_listen: String,
    /// Internal deadline for one scheduling request.
    pub request_timeout: Duration,

    // Storage settings
    /// PostgreSQL connection URL for feature tables and resources.
    pub database_url: String,

    // Message bus settings
    /// Redis connection URL for the pub/sub bus.
    pub bus_url: String,
    /// Maximum publish attempts before a bus error surfaces.
    pub bus_max_attempts: u32,

    // Pipeline settings
    /// Path to the YAML file with the initial pipeline definitions.
    pub pipeline_defs_path: PathBuf,
    /// Interval at which the reloader polls Pipeline resources.
    pub reload_interval: Duration,

    // Extractor settings
    /// Number of workers draining the extraction queue.
    pub extractor_workers: usize,

    // Decision settings
    /// Lifetime of a decision resource before the reaper deletes it.
    pub decision_ttl: Duration,
    /// Capacity of the bounded decision-record queue.
    pub decision_queue_capacity: usize,
    /// Byte budget for the request payload embedded in a decision record.
    pub decision_payload_limit: usize,

    // Descheduler settings
    /// Cadence at which detectors are evaluated.
    pub descheduler_interval: Duration,
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            http_listen: "0.0.0.0:8080".to_string(),
            request_timeout: Duration::from_secs(10),

            database_url: "postgres://localhost/cortex".to_string(),

            bus_url: "redis://localhost:6379".to_string(),
            bus_max_attempts: 3,

            pipeline_defs_path: PathBuf::from("./pipelines.yaml"),
            reload_interval: Duration::from_secs(30),

            extractor_workers: 4,

            decision_ttl: Duration::from_secs(3600),
            decision_queue_capacity: 256,
            decision_payload_limit: 64 * 1024,

            descheduler_interval: Duration::from_secs(300),
        }
    }
}

impl CortexConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CORTEX_HTTP_LISTEN`: listen address (default: 0.0.0.0:8080)
    /// - `CORTEX_REQUEST_TIMEOUT_SECS`: request deadline (default: 10)
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `CORTEX_BUS_URL`: Redis bus URL (default: redis://localhost:6379)
    /// - `CORTEX_BUS_MAX_ATTEMPTS`: publish attempts (default: 3)
    /// - `CORTEX_PIPELINES_FILE`: pipeline definitions YAML (default: ./pipelines.yaml)
    /// - `CORTEX_RELOAD_INTERVAL_SECS`: reloader poll interval (default: 30)
    /// - `CORTEX_EXTRACTOR_WORKERS`: extraction workers (default: 4)
    /// - `CORTEX_DECISION_TTL_SECS`: decision lifetime (default: 3600)
    /// - `CORTEX_DECISION_QUEUE_CAPACITY`: decision queue size (default: 256)
    /// - `CORTEX_DECISION_PAYLOAD_LIMIT`: embedded payload budget (default: 65536)
    /// - `CORTEX_DESCHEDULER_INTERVAL_SECS`: detector cadence (default: 300)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have
    /// invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CORTEX_HTTP_LISTEN") {
            config.http_listen = val;
        }

        if let Ok(val) = std::env::var("CORTEX_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CORTEX_REQUEST_TIMEOUT_SECS")?;
            config.request_timeout = Duration::from_secs(secs);
        }

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("CORTEX_BUS_URL") {
            config.bus_url = val;
        }

        if let Ok(val) = std::env::var("CORTEX_BUS_MAX_ATTEMPTS") {
            config.bus_max_attempts = parse_env_value(&val, "CORTEX_BUS_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("CORTEX_PIPELINES_FILE") {
            config.pipeline_defs_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("CORTEX_RELOAD_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "CORTEX_RELOAD_INTERVAL_SECS")?;
            config.reload_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("CORTEX_EXTRACTOR_WORKERS") {
            config.extractor_workers = parse_env_value(&val, "CORTEX_EXTRACTOR_WORKERS")?;
        }

        if let Ok(val) = std::env::var("CORTEX_DECISION_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "CORTEX_DECISION_TTL_SECS")?;
            config.decision_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("CORTEX_DECISION_QUEUE_CAPACITY") {
            config.decision_queue_capacity =
                parse_env_value(&val, "CORTEX_DECISION_QUEUE_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("CORTEX_DECISION_PAYLOAD_LIMIT") {
            config.decision_payload_limit = parse_env_value(&val, "CORTEX_DECISION_PAYLOAD_LIMIT")?;
        }

        if let Ok(val) = std::env::var("CORTEX_DESCHEDULER_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "CORTEX_DESCHEDULER_INTERVAL_SECS")?;
            config.descheduler_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Sets the bus URL.
    pub fn with_bus_url(mut self, url: impl Into<String>) -> Self {
        self.bus_url = url.into();
        self
    }

    /// Sets the request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the decision TTL.
    pub fn with_decision_ttl(mut self, ttl: Duration) -> Self {
        self.decision_ttl = ttl;
        self
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_listen.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "http_listen cannot be empty".to_string(),
            ));
        }

        if self.request_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.bus_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "bus_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.extractor_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "extractor_workers must be greater than 0".to_string(),
            ));
        }

        if self.decision_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "decision_ttl must be greater than 0".to_string(),
            ));
        }

        if self.decision_queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "decision_queue_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CortexConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.decision_ttl, Duration::from_secs(3600));
        assert_eq!(config.http_listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_builder_methods() {
        let config = CortexConfig::new()
            .with_database_url("postgres://db/cortex")
            .with_bus_url("redis://bus:6379")
            .with_request_timeout(Duration::from_secs(5))
            .with_decision_ttl(Duration::from_secs(60));

        assert_eq!(config.database_url, "postgres://db/cortex");
        assert_eq!(config.bus_url, "redis://bus:6379");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.decision_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = CortexConfig::default();
        config.decision_ttl = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_queue() {
        let mut config = CortexConfig::default();
        config.decision_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_value_error_names_key() {
        let err = parse_env_value::<u64>("not-a-number", "CORTEX_DECISION_TTL_SECS").unwrap_err();
        assert!(err.to_string().contains("CORTEX_DECISION_TTL_SECS"));
    }
}
