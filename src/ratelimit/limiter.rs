//! Core rate limiter facade.
//!
//! The facade owns policy resolution, identifier composition, and a lazy
//! cache of limiter instances. It is constructed once at process start and
//! passed by reference (or `Arc`) wherever checks happen, so tests can build
//! isolated instances with their own stores.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::store::KeyValueStore;

use super::fixed_window::FixedWindowLimiter;
use super::policy::{PolicyTable, RateLimitPolicy, Strategy};
use super::sliding_window::SlidingWindowLimiter;
use super::strategy::{LimiterBackend, RateLimitResult};
use super::token_bucket::TokenBucketLimiter;

/// Default timeout for a single store round-trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// The rate limiter facade.
///
/// Holds one limiter instance per `(strategy, policy)` pair, constructed
/// lazily on first use. Limiter instances are stateless wrappers over the
/// shared store, so a first-use race that builds two instances for the same
/// pair is harmless duplication rather than a correctness issue.
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    policies: PolicyTable,
    default_strategy: Strategy,
    store_timeout: Duration,
    limiters: DashMap<(Strategy, String), Arc<dyn LimiterBackend>>,
}

impl RateLimiter {
    /// Create a facade with the default policy table and fixed-window
    /// strategy.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_policies(store, PolicyTable::default(), Strategy::FixedWindow)
    }

    /// Create a facade with an explicit policy table and default strategy.
    pub fn with_policies(
        store: Arc<dyn KeyValueStore>,
        policies: PolicyTable,
        default_strategy: Strategy,
    ) -> Self {
        Self {
            store,
            policies,
            default_strategy,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            limiters: DashMap::new(),
        }
    }

    /// Override the per-operation store timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Resolve the policy for an endpoint path.
    ///
    /// Exposed so the middleware can report the limit in response headers.
    pub fn resolve_policy(&self, endpoint: &str) -> (&str, &RateLimitPolicy) {
        self.policies.resolve(endpoint)
    }

    /// Check a user-scoped limit for an endpoint.
    pub async fn check_user_limit(&self, user_id: &str, endpoint: &str) -> RateLimitResult {
        let (name, policy) = self.policies.resolve(endpoint);
        let identifier = format!("user:{}:{}", user_id, name);
        self.check(name, policy.clone(), &identifier).await
    }

    /// Check an IP-scoped limit for an endpoint.
    pub async fn check_ip_limit(&self, ip: &str, endpoint: &str) -> RateLimitResult {
        let (name, policy) = self.policies.resolve(endpoint);
        let identifier = format!("ip:{}:{}", ip, name);
        self.check(name, policy.clone(), &identifier).await
    }

    /// Check the global per-user budget across all endpoints.
    pub async fn check_global_user_limit(&self, user_id: &str) -> RateLimitResult {
        let policy = self.policies.global_user.clone();
        let identifier = format!("user:{}:global", user_id);
        self.check("global_user", policy, &identifier).await
    }

    /// Check the global per-IP budget across all endpoints.
    pub async fn check_global_ip_limit(&self, ip: &str) -> RateLimitResult {
        let policy = self.policies.global_ip.clone();
        let identifier = format!("ip:{}:global", ip);
        self.check("global_ip", policy, &identifier).await
    }

    /// Composite check requiring both the IP-scoped and user-scoped limits
    /// to pass. The first rejection short-circuits.
    pub async fn check_both(&self, user_id: &str, ip: &str, endpoint: &str) -> RateLimitResult {
        let ip_result = self.check_ip_limit(ip, endpoint).await;
        if !ip_result.allowed {
            return ip_result;
        }
        self.check_user_limit(user_id, endpoint).await
    }

    /// Full per-request sequence used by the middleware: global IP budget,
    /// then (when authenticated) global user budget, then the endpoint
    /// policy scoped to the user if present or the IP otherwise. The first
    /// rejection short-circuits.
    pub async fn check_request(
        &self,
        user_id: Option<&str>,
        ip: &str,
        endpoint: &str,
    ) -> RateLimitResult {
        let global_ip = self.check_global_ip_limit(ip).await;
        if !global_ip.allowed {
            return global_ip;
        }

        if let Some(user_id) = user_id {
            let global_user = self.check_global_user_limit(user_id).await;
            if !global_user.allowed {
                return global_user;
            }
            self.check_user_limit(user_id, endpoint).await
        } else {
            self.check_ip_limit(ip, endpoint).await
        }
    }

    /// Number of cached limiter instances, primarily useful for tests.
    pub fn limiter_count(&self) -> usize {
        self.limiters.len()
    }

    async fn check(
        &self,
        policy_name: &str,
        policy: RateLimitPolicy,
        identifier: &str,
    ) -> RateLimitResult {
        let strategy = policy.strategy.unwrap_or(self.default_strategy);
        let limiter = self.limiter_for(strategy, policy_name, policy);

        let result = limiter.check_limit(identifier).await;
        if !result.allowed {
            info!(
                policy = %policy_name,
                strategy = %strategy,
                identifier = %identifier,
                total_hits = result.total_hits,
                reset_time = result.reset_time,
                "Rate limit exceeded"
            );
        }
        result
    }

    /// Get or lazily create the limiter for a `(strategy, policy)` pair.
    fn limiter_for(
        &self,
        strategy: Strategy,
        policy_name: &str,
        policy: RateLimitPolicy,
    ) -> Arc<dyn LimiterBackend> {
        let cache_key = (strategy, policy_name.to_string());
        self.limiters
            .entry(cache_key)
            .or_insert_with(|| {
                debug!(
                    policy = %policy_name,
                    strategy = %strategy,
                    window_ms = policy.window_ms,
                    max_requests = policy.max_requests,
                    "Creating limiter instance"
                );
                let store = Arc::clone(&self.store);
                match strategy {
                    Strategy::FixedWindow => Arc::new(FixedWindowLimiter::new(
                        store,
                        policy,
                        self.store_timeout,
                    )),
                    Strategy::SlidingWindow => Arc::new(SlidingWindowLimiter::new(
                        store,
                        policy,
                        self.store_timeout,
                    )),
                    Strategy::TokenBucket => Arc::new(TokenBucketLimiter::new(
                        store,
                        policy,
                        self.store_timeout,
                    )),
                }
            })
            .clone()
    }
}
