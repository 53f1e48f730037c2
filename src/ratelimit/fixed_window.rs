//! Fixed-window limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::store::{KeyValueStore, StoreError};

use super::policy::RateLimitPolicy;
use super::strategy::{check_with_fail_open, window_ttl_seconds, LimiterBackend, RateLimitResult};

/// Counts requests in discrete time buckets keyed by
/// `floor(now / window) * window`.
///
/// Each window gets a fresh store key with a TTL of the window length, so
/// expiry is the end of a counter's lifecycle and no reset logic exists.
/// Rejected requests do not increment the counter.
///
/// Boundary effect inherent to the algorithm: a client can spend its full
/// budget at the tail of one window and again at the head of the next, up to
/// `2 * max_requests` in a short span straddling the boundary. This is
/// accepted, documented behavior; the sliding-window strategy exists for
/// policies where it matters.
pub struct FixedWindowLimiter {
    store: Arc<dyn KeyValueStore>,
    policy: RateLimitPolicy,
    store_timeout: Duration,
}

impl FixedWindowLimiter {
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

        let window_start = now_ms / window_ms * window_ms;
        let reset_time = window_start + window_ms;
        let key = format!("{}:{}", identifier, window_start);

        let count: u64 = self
            .store
            .get(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if count >= max_requests {
            trace!(key = %key, count = count, "Window budget exhausted");
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_time,
                total_hits: count,
            });
        }

        let new_count = self.store.increment(&key).await?;
        if new_count == 1 {
            // First writer in a window owns the expiry.
            self.store
                .expire(&key, window_ttl_seconds(window_ms))
                .await?;
        }

        Ok(RateLimitResult {
            allowed: true,
            remaining: max_requests.saturating_sub(new_count),
            reset_time,
            total_hits: new_count,
        })
    }
}

#[async_trait]
impl LimiterBackend for FixedWindowLimiter {
    async fn check_limit_at(&self, identifier: &str, now_ms: u64) -> RateLimitResult {
        check_with_fail_open(
            "fixed_window",
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
    use crate::store::testutil::{FailingStore, HangingStore};
    use crate::store::MemoryStore;

    fn limiter(store: Arc<dyn KeyValueStore>, window_ms: u64, max_requests: u64) -> FixedWindowLimiter {
        FixedWindowLimiter::new(
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
            let result = limiter.check_limit_at("user:42:translate", now).await;
            assert!(result.allowed, "request {} should be allowed", i + 1);
            assert_eq!(result.remaining, 4 - i);
        }
    }

    #[tokio::test]
    async fn test_rejects_over_limit_without_incrementing() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 5);
        let now = 1_000_000;

        for _ in 0..5 {
            limiter.check_limit_at("user:42:translate", now).await;
        }

        // Rejected requests do not consume quota beyond what already exists.
        for _ in 0..3 {
            let result = limiter.check_limit_at("user:42:translate", now).await;
            assert!(!result.allowed);
            assert_eq!(result.remaining, 0);
            assert_eq!(result.total_hits, 5);
        }
    }

    #[tokio::test]
    async fn test_reset_time_is_window_boundary() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 5);

        // 90s into the epoch: the window is [60_000, 120_000).
        let result = limiter.check_limit_at("user:1:test", 90_000).await;
        assert!(result.allowed);
        assert_eq!(result.reset_time, 120_000);
    }

    #[tokio::test]
    async fn test_fresh_window_starts_at_zero_hits() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 2);

        let now = 1_000_000;
        limiter.check_limit_at("user:1:test", now).await;
        limiter.check_limit_at("user:1:test", now).await;
        assert!(!limiter.check_limit_at("user:1:test", now).await.allowed);

        // Advance past the reset boundary: a new window key starts fresh.
        let later = now + 60_000;
        let result = limiter.check_limit_at("user:1:test", later).await;
        assert!(result.allowed);
        assert_eq!(result.total_hits, 1);
    }

    #[tokio::test]
    async fn test_boundary_double_burst_is_permitted() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 3);

        // Tail of one window, head of the next: both full budgets go through.
        let tail = 119_000;
        let head = 120_500;
        for _ in 0..3 {
            assert!(limiter.check_limit_at("user:1:test", tail).await.allowed);
        }
        for _ in 0..3 {
            assert!(limiter.check_limit_at("user:1:test", head).await.allowed);
        }
    }

    #[tokio::test]
    async fn test_identifiers_do_not_share_state() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 60_000, 1);
        let now = 1_000_000;

        assert!(limiter.check_limit_at("user:1:test", now).await.allowed);
        assert!(limiter.check_limit_at("user:2:test", now).await.allowed);
        assert!(!limiter.check_limit_at("user:1:test", now).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_errors() {
        let limiter = limiter(Arc::new(FailingStore), 60_000, 5);

        let result = limiter.check_limit_at("user:1:test", 1_000_000).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_hangs() {
        let limiter = FixedWindowLimiter::new(
            Arc::new(HangingStore),
            RateLimitPolicy::new(60_000, 5),
            Duration::from_millis(20),
        );

        let result = limiter.check_limit_at("user:1:test", 1_000_000).await;
        assert!(result.allowed);
    }
}
