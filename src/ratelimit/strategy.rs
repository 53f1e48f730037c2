//! Limiter strategy trait, check results, and the shared fail-open policy.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::warn;

use crate::store::StoreError;

use super::policy::RateLimitPolicy;

/// The outcome of a single limit check.
///
/// A computed snapshot, produced fresh on every check and never persisted.
/// `remaining` is always `max_requests - total_hits`, floored at zero, and
/// `reset_time` is in the future whenever `allowed` is false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window or bucket
    pub remaining: u64,
    /// Epoch milliseconds at which quota becomes available again
    pub reset_time: u64,
    /// Requests counted against the policy so far
    pub total_hits: u64,
}

/// A limiter strategy bound to one policy and one store.
///
/// Implementations are stateless wrappers over the key-value store: all
/// counter and bucket state serializes through store keys, so any number of
/// instances sharing a store enforce one quota.
#[async_trait]
pub trait LimiterBackend: Send + Sync {
    /// Check the limit for an identifier at an explicit point in time.
    ///
    /// Production callers go through [`check_limit`](Self::check_limit);
    /// taking the clock as a parameter keeps window and refill arithmetic
    /// deterministic under test.
    async fn check_limit_at(&self, identifier: &str, now_ms: u64) -> RateLimitResult;

    /// Check the limit for an identifier against the wall clock.
    async fn check_limit(&self, identifier: &str) -> RateLimitResult {
        self.check_limit_at(identifier, epoch_ms()).await
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Window length in whole seconds, rounded up, for store TTLs.
pub(crate) fn window_ttl_seconds(window_ms: u64) -> u64 {
    window_ms.div_ceil(1000)
}

/// Run a strategy's check under a timeout, converting any store error or
/// timeout into an allowed result.
///
/// This is the single place the fail-open policy lives. Throttling must never
/// become a denial-of-service vector against legitimate traffic when the
/// backing store misbehaves, so store outages cost one quota slot of accuracy
/// rather than availability. Every fail-open event is logged with policy and
/// identifier context so a sustained outage stays operationally visible.
pub(crate) async fn check_with_fail_open<F>(
    strategy: &str,
    policy: &RateLimitPolicy,
    identifier: &str,
    now_ms: u64,
    timeout: Duration,
    check: F,
) -> RateLimitResult
where
    F: Future<Output = Result<RateLimitResult, StoreError>> + Send,
{
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(
                strategy = %strategy,
                identifier = %identifier,
                error = %e,
                "Store error during limit check, failing open"
            );
            fail_open_result(policy, now_ms)
        }
        Err(_) => {
            warn!(
                strategy = %strategy,
                identifier = %identifier,
                timeout_ms = timeout.as_millis() as u64,
                "Store timed out during limit check, failing open"
            );
            fail_open_result(policy, now_ms)
        }
    }
}

/// The allowed result handed back when the store is unreachable: the request
/// proceeds and is assumed to be the only hit in the window.
fn fail_open_result(policy: &RateLimitPolicy, now_ms: u64) -> RateLimitResult {
    RateLimitResult {
        allowed: true,
        remaining: policy.max_requests.saturating_sub(1),
        reset_time: now_ms + policy.window_ms,
        total_hits: 1,
    }
}
