//! Configuration management.
//!
//! Values come from an optional file followed by `HIVE__`-prefixed
//! environment variables, e.g. `HIVE__REDIS__HOST` or `HIVE__WORKER__INTERVAL=5s`.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{HiveError, Result};
use crate::jobs::worker::WorkerConfig;
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Environment variable naming an optional configuration file.
pub const CONFIG_PATH_ENV: &str = "HIVE_CONFIG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Store connection configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue defaults
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker defaults
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection scheme: `tcp`, `tls` or `unix`
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Host name, or socket path for the `unix` scheme
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub database: i64,

    /// Prefix applied to every key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Full connection URL; overrides the individual fields when set
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            database: 0,
            namespace: default_namespace(),
            url: None,
        }
    }
}

impl RedisConfig {
    /// Build the client connection URL.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let auth = self
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!(":{}@", p))
            .unwrap_or_default();

        match self.scheme.as_str() {
            "unix" => {
                let mut url = format!("redis+unix://{}?db={}", self.host, self.database);
                if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
                    url.push_str(&format!("&pass={}", password));
                }
                url
            }
            "tls" => format!("rediss://{}{}:{}/{}", auth, self.host, self.port, self.database),
            _ => format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.database),
        }
    }

    /// The connection URL with any password masked, suitable for logs.
    pub fn redacted_url(&self) -> String {
        crate::telemetry::SensitiveFieldRedactor::global().redact_value(&self.connection_url())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue used when a producer does not name one
    #[serde(default = "default_queue_name")]
    pub default: String,

    /// How long processed and cancelled job records are kept
    #[serde(default = "default_processed_ttl", with = "humantime_serde")]
    pub processed_ttl: Duration,

    /// How long failed job records are kept
    #[serde(default = "default_failed_ttl", with = "humantime_serde")]
    pub failed_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default: default_queue_name(),
            processed_ttl: default_processed_ttl(),
            failed_ttl: default_failed_ttl(),
        }
    }
}

fn default_scheme() -> String { "tcp".to_string() }
fn default_redis_host() -> String { "127.0.0.1".to_string() }
fn default_redis_port() -> u16 { 6379 }
fn default_namespace() -> String { "hive".to_string() }
fn default_queue_name() -> String { "default".to_string() }
fn default_processed_ttl() -> Duration { Duration::from_secs(24 * 60 * 60) }
fn default_failed_ttl() -> Duration { Duration::from_secs(7 * 24 * 60 * 60) }

impl Config {
    /// Load configuration from the environment, reading the file named by
    /// `HIVE_CONFIG` first if it is set.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(&path),
            _ => {
                let config = config::Config::builder()
                    .add_source(config::Environment::with_prefix("HIVE").separator("__"))
                    .build()?;

                let cfg: Config = config.try_deserialize()?;
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("HIVE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the worker loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.redis.namespace.trim_matches(':').is_empty() {
            return Err(HiveError::configuration("redis.namespace must not be empty"));
        }
        if !matches!(self.redis.scheme.as_str(), "tcp" | "tls" | "unix") {
            return Err(HiveError::configuration(format!(
                "redis.scheme \"{}\" is not one of tcp, tls, unix",
                self.redis.scheme
            )));
        }
        if self.queue.default.is_empty() {
            return Err(HiveError::configuration("queue.default must not be empty"));
        }
        self.worker.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.connection_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn test_redis_url_with_password_is_redacted() {
        let config = RedisConfig {
            password: Some("hunter2".into()),
            database: 3,
            ..Default::default()
        };
        assert_eq!(config.connection_url(), "redis://:hunter2@127.0.0.1:6379/3");
        assert!(!config.redacted_url().contains("hunter2"));
    }

    #[test]
    fn test_redis_url_schemes() {
        let tls = RedisConfig { scheme: "tls".into(), ..Default::default() };
        assert!(tls.connection_url().starts_with("rediss://"));

        let unix = RedisConfig {
            scheme: "unix".into(),
            host: "/tmp/redis.sock".into(),
            ..Default::default()
        };
        assert_eq!(unix.connection_url(), "redis+unix:///tmp/redis.sock?db=0");

        let explicit = RedisConfig { url: Some("redis://cache:6380".into()), ..Default::default() };
        assert_eq!(explicit.connection_url(), "redis://cache:6380");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.default, "default");
        assert_eq!(config.queue.failed_ttl, Duration::from_secs(604800));
    }

    #[test]
    fn test_validate_rejects_empty_namespace() {
        let mut config = Config::default();
        config.redis.namespace = ":".into();
        assert!(config.validate().is_err());
    }
}
