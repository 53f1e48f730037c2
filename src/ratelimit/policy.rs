//! Throttling policy configuration and endpoint matching.
//!
//! This module handles loading the per-endpoint policy table from
//! configuration and resolving the policy that applies to a request path.
//! Resolution uses substring matching with the longest matching pattern
//! winning, falling back to a default policy.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Limiting strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Discrete time buckets with a single counter per window
    FixedWindow,
    /// Trailing-window timestamp log
    SlidingWindow,
    /// Continuous refill allowing bursts up to capacity
    TokenBucket,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::FixedWindow => write!(f, "fixed_window"),
            Strategy::SlidingWindow => write!(f, "sliding_window"),
            Strategy::TokenBucket => write!(f, "token_bucket"),
        }
    }
}

/// One logical limiting policy: a request budget over a time window.
///
/// Immutable once constructed. Zero values are a configuration error and are
/// rejected by [`PolicyTable::validate`] at load time, never at check time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum requests allowed within the window
    pub max_requests: u64,
    /// Strategy override for this policy (falls back to the service default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
}

impl RateLimitPolicy {
    /// Create a policy with the service-default strategy.
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            strategy: None,
        }
    }

    /// Create a policy pinned to a specific strategy.
    pub fn with_strategy(window_ms: u64, max_requests: u64, strategy: Strategy) -> Self {
        Self {
            window_ms,
            max_requests,
            strategy: Some(strategy),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_ms == 0 {
            return Err(TurnstileError::Config(format!(
                "policy '{}' has a zero window_ms",
                name
            )));
        }
        if self.max_requests == 0 {
            return Err(TurnstileError::Config(format!(
                "policy '{}' has a zero max_requests",
                name
            )));
        }
        Ok(())
    }
}

/// A named endpoint pattern with its policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Substring matched against the request endpoint
    pub pattern: String,
    /// The policy applied when the pattern matches
    #[serde(flatten)]
    pub policy: RateLimitPolicy,
}

/// The full policy table: per-endpoint entries plus the global and fallback
/// policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Per-endpoint policies
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointPolicy>,

    /// Fallback policy for endpoints with no matching entry
    #[serde(default = "default_fallback")]
    pub fallback: RateLimitPolicy,

    /// Global per-user budget across all endpoints
    #[serde(default = "default_global_user")]
    pub global_user: RateLimitPolicy,

    /// Global per-IP budget across all endpoints
    #[serde(default = "default_global_ip")]
    pub global_ip: RateLimitPolicy,
}

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 3_600_000;

fn default_endpoints() -> Vec<EndpointPolicy> {
    let entry = |pattern: &str, window_ms: u64, max_requests: u64| EndpointPolicy {
        pattern: pattern.to_string(),
        policy: RateLimitPolicy::new(window_ms, max_requests),
    };

    vec![
        entry("auth/login", 15 * MINUTE_MS, 5),
        entry("auth/register", HOUR_MS, 3),
        entry("auth/logout", MINUTE_MS, 10),
        entry("translation", MINUTE_MS, 30),
        entry("vocabulary", MINUTE_MS, 100),
        entry("practice", MINUTE_MS, 50),
    ]
}

fn default_fallback() -> RateLimitPolicy {
    RateLimitPolicy::new(MINUTE_MS, 60)
}

fn default_global_user() -> RateLimitPolicy {
    RateLimitPolicy::new(MINUTE_MS, 200)
}

fn default_global_ip() -> RateLimitPolicy {
    RateLimitPolicy::new(MINUTE_MS, 100)
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            fallback: default_fallback(),
            global_user: default_global_user(),
            global_ip: default_global_ip(),
        }
    }
}

impl PolicyTable {
    /// Load a policy table from a YAML file, validating every policy.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy table from a YAML string, validating every policy.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: PolicyTable = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policy table: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    /// Validate every policy in the table.
    pub fn validate(&self) -> Result<()> {
        for entry in &self.endpoints {
            if entry.pattern.is_empty() {
                return Err(TurnstileError::Config(
                    "endpoint policy with an empty pattern".to_string(),
                ));
            }
            entry.policy.validate(&entry.pattern)?;
        }
        self.fallback.validate("fallback")?;
        self.global_user.validate("global_user")?;
        self.global_ip.validate("global_ip")?;
        Ok(())
    }

    /// Resolve the policy for an endpoint.
    ///
    /// Every entry whose pattern occurs in the endpoint matches; the longest
    /// pattern wins so more specific entries take precedence. Returns the
    /// pattern (used as the policy namespace in store keys) and the policy,
    /// or the fallback when nothing matches.
    pub fn resolve(&self, endpoint: &str) -> (&str, &RateLimitPolicy) {
        self.endpoints
            .iter()
            .filter(|entry| endpoint.contains(&entry.pattern))
            .max_by_key(|entry| entry.pattern.len())
            .map(|entry| (entry.pattern.as_str(), &entry.policy))
            .unwrap_or(("default", &self.fallback))
    }
}
