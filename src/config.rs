//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::http::HeaderOptions;
use crate::ratelimit::{ConfigRegistry, RedisStoreOptions, DEFAULT_KEY_PREFIX};

/// Prefix for environment overrides, e.g. `RATEWARDEN__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Hardening headers added to every response
    #[serde(default)]
    pub headers: HeaderOptions,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process counters, per instance
    #[default]
    Local,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for Redis counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each store round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Local store sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn redis_options(&self) -> RedisStoreOptions {
        RedisStoreOptions {
            prefix: self.key_prefix.clone(),
            timeout: self.timeout(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML rules file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Start from the built-in operation presets
    #[serde(default = "default_include_presets")]
    pub include_presets: bool,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            include_presets: default_include_presets(),
        }
    }
}

fn default_include_presets() -> bool {
    true
}

impl RateLimitingConfig {
    /// Build the operation registry described by this configuration.
    pub fn registry(&self) -> crate::error::Result<ConfigRegistry> {
        let mut builder = ConfigRegistry::builder();
        if self.include_presets {
            builder = builder.with_presets();
        }
        if let Some(path) = &self.rules_path {
            builder = builder.rules_file(path)?;
        }
        Ok(builder.build()?)
    }
}

impl WardenConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WardenConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the service unusable.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(crate::error::WardenError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from an optional file with environment overrides.
    ///
    /// Environment variables use the `RATEWARDEN` prefix and `__` between
    /// nesting levels.
    pub fn load(path: Option<&Path>) -> crate::error::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WardenConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
