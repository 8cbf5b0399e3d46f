//! Proxy configuration
//!
//! Loaded from a YAML file, then overlaid with `PORT` / `BACKENDS` from the
//! environment and validated before the server binds.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid {name} value: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub backends: Vec<String>,

    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Per-client overrides, keyed by client identifier
    #[serde(default)]
    pub client_limits: HashMap<String, RateLimitConfig>,
}

/// Bucket size and refill speed (tokens per second)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_rate: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_secs: 2,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub ttl_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            ttl_secs: 300,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Config {
    /// Read, overlay with the process environment, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut cfg = Self::from_yaml_str(&raw)?;
        cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `PORT` and `BACKENDS` overrides using `lookup` as the environment.
    ///
    /// `BACKENDS` is comma-separated; its entries are appended after the
    /// backends from the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").filter(|p| !p.is_empty()) {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "PORT",
                value: port.clone(),
            })?;
        }

        if let Some(backends) = lookup("BACKENDS") {
            self.backends.extend(
                backends
                    .split(',')
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(String::from),
            );
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }

        if self.backends.is_empty() {
            return Err(ConfigError::Invalid("at least one backend is required".into()));
        }

        for backend in &self.backends {
            let url = url::Url::parse(backend)
                .map_err(|e| ConfigError::Invalid(format!("backend {backend:?}: {e}")))?;
            if url.scheme() != "http" {
                return Err(ConfigError::Invalid(format!(
                    "backend {backend:?}: only http backends are supported"
                )));
            }
            if url.host_str().is_none() {
                return Err(ConfigError::Invalid(format!("backend {backend:?}: missing host")));
            }
        }

        if self.health_check.interval_secs == 0 {
            return Err(ConfigError::Invalid("health_check.interval_secs must be non-zero".into()));
        }

        if self.cleanup.interval_secs == 0 {
            return Err(ConfigError::Invalid("cleanup.interval_secs must be non-zero".into()));
        }

        // A zero timeout fails every probe or request before it starts.
        let timeouts = [
            ("health_check.timeout_secs", self.health_check.timeout_secs),
            ("upstream.connect_timeout_secs", self.upstream.connect_timeout_secs),
            ("upstream.request_timeout_secs", self.upstream.request_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
