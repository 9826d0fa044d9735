//! Configuration management for the global limiter.
//!
//! Configuration can be read from a single YAML file, or assembled from
//! several layers where later layers override earlier ones:
//!
//! 1. `$HOME/.global-limiter/config.{yaml,toml,json}`
//! 2. `./.global-limiter/config.{yaml,toml,json}`
//! 3. `GLOBAL_LIMITER__*` environment variables (nested with `__`)
//! 4. an explicitly supplied file

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{LimiterError, Result};
use crate::ratelimit::LimiterIdentity;

/// Directory searched for configuration, relative to `$HOME` and the cwd.
pub const CONFIG_DIR: &str = ".global-limiter";
/// Base name of the configuration file (extension picks the format).
pub const CONFIG_NAME: &str = "config";
/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "GLOBAL_LIMITER";

/// Main configuration for a global limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Connection URL of the shared window store
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Name of the limited resource
    #[serde(default)]
    pub key: String,

    /// Maximum permits granted per time period
    #[serde(default)]
    pub max_rate: u64,

    /// Length of the sliding window in seconds
    #[serde(default = "default_time_period_secs")]
    pub time_period_secs: f64,

    /// Namespace prepended to the store key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Store failure retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key: String::new(),
            max_rate: 0,
            time_period_secs: default_time_period_secs(),
            prefix: default_prefix(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_time_period_secs() -> f64 {
    60.0
}

fn default_prefix() -> String {
    "GlobalLimiter".to_string()
}

/// Retry policy applied when the window store is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive store failures tolerated before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter as a fraction of each delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Upper bound on one store round-trip in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_operation_timeout_ms() -> u64 {
    2000
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// How long a single store call may take before it counts as a failure.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Values that take precedence over every configuration layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub redis_url: Option<String>,
    pub key: Option<String>,
    pub max_rate: Option<u64>,
    pub time_period_secs: Option<f64>,
    pub prefix: Option<String>,
}

impl ConfigOverrides {
    fn apply(
        &self,
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(builder
            .set_override_option("redis_url", self.redis_url.clone())?
            .set_override_option("key", self.key.clone())?
            .set_override_option("max_rate", self.max_rate.map(|v| v as i64))?
            .set_override_option("time_period_secs", self.time_period_secs)?
            .set_override_option("prefix", self.prefix.clone())?)
    }
}

impl LimiterConfig {
    /// Create a configuration for `key` allowing `max_rate` permits per `time_period_secs`.
    pub fn new(key: impl Into<String>, max_rate: u64, time_period_secs: f64) -> Self {
        Self {
            key: key.into(),
            max_rate,
            time_period_secs,
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the standard configuration layers, optionally topped by
    /// `explicit`, then apply `overrides`.
    pub fn load(explicit: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut files = Vec::new();
        if let Some(home) = std::env::var_os("HOME") {
            files.push(PathBuf::from(home).join(CONFIG_DIR).join(CONFIG_NAME));
        }
        files.push(PathBuf::from(CONFIG_DIR).join(CONFIG_NAME));

        let builder = Self::file_layers(config::Config::builder(), &files)
            .add_source(Self::env_source(ENV_PREFIX));

        let builder = match explicit {
            Some(path) => {
                info!(path = %path.display(), "Loading explicit configuration file");
                builder.add_source(config::File::from(path).required(true))
            }
            None => builder,
        };

        Self::finish(overrides.apply(builder)?)
    }

    /// Load configuration from `files` in order, then from environment
    /// variables starting with `env_prefix` if one is given.
    ///
    /// Missing files are skipped. A path without an extension is probed
    /// for every supported format.
    pub fn load_layered(files: &[PathBuf], env_prefix: Option<&str>) -> Result<Self> {
        let builder = Self::file_layers(config::Config::builder(), files);
        let builder = match env_prefix {
            Some(prefix) => builder.add_source(Self::env_source(prefix)),
            None => builder,
        };
        Self::finish(builder)
    }

    fn file_layers(
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
        files: &[PathBuf],
    ) -> config::ConfigBuilder<config::builder::DefaultState> {
        for path in files {
            debug!(path = %path.display(), "Adding configuration layer");
            let source = match path.extension() {
                Some(_) => config::File::from(path.as_path()),
                None => config::File::with_name(&path.to_string_lossy()),
            };
            builder = builder.add_source(source.required(false));
        }
        builder
    }

    fn env_source(prefix: &str) -> config::Environment {
        config::Environment::with_prefix(prefix)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: LimiterConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that can never describe a working limiter.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(LimiterError::Config("key must not be empty".to_string()));
        }
        if self.redis_url.is_empty() {
            return Err(LimiterError::Config("redis_url must not be empty".to_string()));
        }
        if self.max_rate == 0 {
            return Err(LimiterError::Config("max_rate must be positive".to_string()));
        }
        if self.retry.operation_timeout_ms == 0 {
            return Err(LimiterError::Config(
                "retry.operation_timeout_ms must be positive".to_string(),
            ));
        }
        self.time_period()?;
        Ok(())
    }

    /// The sliding window length.
    ///
    /// Window scores are whole milliseconds, so the period must be a whole,
    /// positive number of milliseconds that fits in a `Duration`.
    pub fn time_period(&self) -> Result<Duration> {
        let secs = self.time_period_secs;
        let invalid = |reason: &str| {
            LimiterError::Config(format!("time_period_secs {} {}", secs, reason))
        };

        Duration::try_from_secs_f64(secs).map_err(|_| invalid("is out of range"))?;
        let millis = secs * 1000.0;
        let whole = millis.round();
        if (millis - whole).abs() > 1e-6 {
            return Err(invalid("is not a whole number of milliseconds"));
        }
        if whole < 1.0 {
            return Err(invalid("is shorter than one millisecond"));
        }
        Ok(Duration::from_millis(whole as u64))
    }

    /// Build the limiter identity described by this configuration.
    pub fn identity(&self) -> Result<LimiterIdentity> {
        Ok(LimiterIdentity::new(
            &self.prefix,
            &self.key,
            self.max_rate,
            self.time_period()?,
        ))
    }
}
