//! Sliding-window limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::store::{KeyValueStore, StoreError};

use super::policy::RateLimitPolicy;
use super::strategy::{check_with_fail_open, window_ttl_seconds, LimiterBackend, RateLimitResult};

/// Approximates a continuous trailing window with a per-identifier timestamp
/// log, trimmed on every check.
///
/// The log is a JSON array of epoch-millisecond entries stored under one key
/// with a TTL of the window length, so abandoned logs self-expire. Unlike the
/// fixed window there is no boundary double-burst: no more than
/// `max_requests` are ever allowed within any trailing `window_ms` span. The
/// cost is per-entry bookkeeping instead of a single counter, which makes
/// this the preferred strategy for audit-sensitive policies such as login
/// attempts.
pub struct SlidingWindowLimiter {
    store: Arc<dyn KeyValueStore>,
    policy: RateLimitPolicy,
    store_timeout: Duration,
}

impl SlidingWindowLimiter {
    /// Create a limiter for one policy over the given store.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        policy: RateLimitPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            store_timeout,
        }
    }

    async fn try_check(&self, identifier: &str, now_ms: u64) -> Result<RateLimitResult, StoreError> {
        let window_ms = self.policy.window_ms;
        let max_requests = self.policy.max_requests;
        let key = format!("{}:log", identifier);

        let mut timestamps: Vec<u64> = match self.store.get(&key).await? {
            // A corrupt log is treated as absent rather than failing the check.
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };

        let cutoff = now_ms.saturating_sub(window_ms);
        timestamps.retain(|&t| t > cutoff);

        let count = timestamps.len() as u64;
        if count >= max_requests {
            // Reject without recording; the trimmed log is not persisted so
            // the key's expiry is not refreshed by rejected traffic.
            trace!(key = %key, count = count, "Trailing window budget exhausted");
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_time: now_ms + window_ms,
                total_hits: count,
            });
        }

        timestamps.push(now_ms);
        let serialized = serde_json::to_string(&timestamps)?;
        self.store
            .set_with_expiry(&key, window_ttl_seconds(window_ms), &serialized)
            .await?;

        let total_hits = count + 1;
        Ok(RateLimitResult {
            allowed: true,
            remaining: max_requests.saturating_sub(total_hits),
            reset_time: now_ms + window_ms,
            total_hits,
        })
    }
}

#[async_trait]
impl LimiterBackend for SlidingWindowLimiter {
    async fn check_limit_at(&self, identifier: &str, now_ms: u64) -> RateLimitResult {
        check_with_fail_open(
            "sliding_window",
            &self.policy,
            identifier,
            now_ms,
            self.store_timeout,
            self.try_check(identifier, now_ms),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::FailingStore;
    use crate::store::MemoryStore;

    fn limiter(
        store: Arc<dyn KeyValueStore>,
        window_ms: u64,
        max_requests: u64,
    ) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            store,
            RateLimitPolicy::new(window_ms, max_requests),
            Duration::from_millis(250),
        )
    }

    #[tokio::test]
    async fn test_allows_up_to_max_requests() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 5);
        let now = 1_000_000;

        for i in 0..5 {
            let result = limiter.check_limit_at("user:1:login", now + i).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, 4 - i);
        }

        let result = limiter.check_limit_at("user:1:login", now + 10).await;
        assert!(!result.allowed);
        assert_eq!(result.total_hits, 5);
    }

    #[tokio::test]
    async fn test_no_boundary_double_burst() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 3);

        // Full budget near the end of a fixed-window boundary...
        for i in 0..3 {
            assert!(limiter.check_limit_at("ip:10.0.0.1:api", 119_000 + i).await.allowed);
        }

        // ...then more just after the boundary, still inside the trailing
        // 60s span. A fixed window would allow these; the sliding window
        // must not.
        for i in 0..3 {
            let result = limiter.check_limit_at("ip:10.0.0.1:api", 120_500 + i).await;
            assert!(!result.allowed);
        }
    }

    #[tokio::test]
    async fn test_quota_recovers_as_entries_age_out() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 2);

        assert!(limiter.check_limit_at("user:1:login", 10_000).await.allowed);
        assert!(limiter.check_limit_at("user:1:login", 30_000).await.allowed);
        assert!(!limiter.check_limit_at("user:1:login", 40_000).await.allowed);

        // 70_001: the 10_000 entry has aged out of the trailing window.
        let result = limiter.check_limit_at("user:1:login", 70_001).await;
        assert!(result.allowed);
        assert_eq!(result.total_hits, 2);
    }

    #[tokio::test]
    async fn test_reset_time_is_conservative_upper_bound() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 1);

        limiter.check_limit_at("user:1:login", 10_000).await;
        let result = limiter.check_limit_at("user:1:login", 20_000).await;

        assert!(!result.allowed);
        assert_eq!(result.reset_time, 80_000);
    }

    #[tokio::test]
    async fn test_corrupt_log_treated_as_empty() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_with_expiry("user:1:login:log", 60, "not json")
            .await
            .unwrap();

        let limiter = limiter(store, 60_000, 2);
        let result = limiter.check_limit_at("user:1:login", 10_000).await;
        assert!(result.allowed);
        assert_eq!(result.total_hits, 1);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_errors() {
        let limiter = limiter(Arc::new(FailingStore), 60_000, 5);

        let result = limiter.check_limit_at("user:1:login", 1_000_000).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }
}
