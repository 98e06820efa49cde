//! Configuration management for Ratekeeper.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{RateKeeperError, Result};
use crate::ratelimit::Policy;

/// Prefix for environment overrides, e.g. `RATEKEEPER__RATE_LIMITING__LIMIT=50`.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for a Ratekeeper deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What a caller-facing check does when the limiter cannot decide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultMode {
    /// Reject the request
    #[default]
    Closed,
    /// Admit the request
    Open,
}

/// Backing store for client windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Sharded map with per-key locking
    #[default]
    Sharded,
    /// Single map behind one lock
    Locked,
}

/// Rate limiter configuration.
///
/// Read once at startup; [`LimiterConfig::validate`] runs before a limiter is
/// built so that bad values never surface at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum admitted requests per client within one window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Counting strategy
    #[serde(default)]
    pub policy: Policy,

    /// Header to key clients on; the peer address is used when unset
    #[serde(default)]
    pub key_header: Option<String>,

    /// Period of the background sweep in milliseconds; defaults to the window
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,

    /// Outcome used when a check hits an internal fault
    #[serde(default)]
    pub on_fault: FaultMode,

    /// Backing store
    #[serde(default)]
    pub store: StoreKind,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            policy: Policy::default(),
            key_header: None,
            sweep_interval_ms: None,
            on_fault: FaultMode::default(),
            store: StoreKind::default(),
        }
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

impl LimiterConfig {
    /// Config with the given budget and default everything else.
    pub fn new(limit: u64, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: StoreKind) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_fault_mode(mut self, on_fault: FaultMode) -> Self {
        self.on_fault = on_fault;
        self
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(RateKeeperError::Config("limit must be greater than 0".to_string()));
        }
        if self.window_ms == 0 {
            return Err(RateKeeperError::Config("window_ms must be greater than 0".to_string()));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(RateKeeperError::Config(
                "sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(header) = &self.key_header {
            if header.trim().is_empty() {
                return Err(RateKeeperError::Config("key_header must not be empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.unwrap_or(self.window_ms))
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateKeeperError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under
    /// `RATEKEEPER__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_layered(path, env_source())
    }

    fn load_layered(path: Option<&str>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }

        let settings = builder
            .add_source(env)
            .build()
            .map_err(|e| RateKeeperError::Config(e.to_string()))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| RateKeeperError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }
}

fn env_source() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
