//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{PolicyTable, Strategy};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Key-value store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Key-value store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store, suitable for tests and single-instance deployments
    Memory,
    /// Redis, required for shared quotas across multiple instances
    Redis,
}

/// Key-value store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL (ignored for the memory backend)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Timeout for a single store round-trip, in milliseconds; checks fail
    /// open when it elapses
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_command_timeout() -> u64 {
    250
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Strategy used by policies that do not pin one
    #[serde(default = "default_strategy")]
    pub default_strategy: Strategy,

    /// Policy table; omitted sections keep the built-in defaults
    #[serde(default)]
    pub policies: PolicyTable,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            policies: PolicyTable::default(),
        }
    }
}

fn default_strategy() -> Strategy {
    Strategy::FixedWindow
}

impl TurnstileConfig {
    /// Load configuration from a YAML file, validating the policy table.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string, validating the policy table.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.rate_limiting.policies.validate()?;
        if config.store.command_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}
