//! Token-bucket limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::store::{KeyValueStore, StoreError};

use super::policy::RateLimitPolicy;
use super::strategy::{check_with_fail_open, window_ttl_seconds, LimiterBackend, RateLimitResult};

/// Serialized per-identifier bucket state.
///
/// Stored as JSON with a TTL of the window length so abandoned buckets
/// self-expire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
}

/// Continuous-refill limiter allowing bursts up to capacity while enforcing
/// an average rate.
///
/// Capacity is `max_requests` and the refill rate is
/// `max_requests / (window_ms / 1000)` tokens per second. A new identifier
/// starts with a full bucket, so a burst of `max_requests` back-to-back
/// requests is allowed even with zero elapsed time; sustained throughput is
/// bounded by the refill rate. Strictly more permissive than the window
/// strategies for bursty-but-compliant clients.
pub struct TokenBucketLimiter {
    store: Arc<dyn KeyValueStore>,
    policy: RateLimitPolicy,
    store_timeout: Duration,
}

impl TokenBucketLimiter {
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

    /// Refill rate in tokens per second.
    fn refill_rate(&self) -> f64 {
        self.policy.max_requests as f64 / (self.policy.window_ms as f64 / 1000.0)
    }

    async fn try_check(&self, identifier: &str, now_ms: u64) -> Result<RateLimitResult, StoreError> {
        let capacity = self.policy.max_requests as f64;
        let key = format!("{}:bucket", identifier);

        let state = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str::<BucketState>(&raw).ok(),
            None => None,
        };
        // Unknown identifiers start with a full bucket.
        let state = state.unwrap_or(BucketState {
            tokens: capacity,
            last_refill: now_ms,
        });

        // Refill in millisecond units so exact multiples of the refill
        // interval produce whole tokens.
        let elapsed_ms = now_ms.saturating_sub(state.last_refill);
        let refilled = elapsed_ms as f64 * self.policy.max_requests as f64
            / self.policy.window_ms as f64;
        let tokens = (state.tokens + refilled).min(capacity);

        let ttl = window_ttl_seconds(self.policy.window_ms);
        let rate = self.refill_rate();

        if tokens < 1.0 {
            let refreshed = BucketState {
                tokens,
                last_refill: now_ms,
            };
            self.store
                .set_with_expiry(&key, ttl, &serde_json::to_string(&refreshed)?)
                .await?;

            let wait_ms = ((1.0 - tokens) / rate * 1000.0).ceil() as u64;
            trace!(key = %key, tokens = tokens, "Bucket empty");
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_time: now_ms + wait_ms,
                total_hits: self.policy.max_requests,
            });
        }

        let tokens = tokens - 1.0;
        let updated = BucketState {
            tokens,
            last_refill: now_ms,
        };
        self.store
            .set_with_expiry(&key, ttl, &serde_json::to_string(&updated)?)
            .await?;

        let remaining = tokens.floor() as u64;
        // Time until the bucket refills back to capacity.
        let refill_ms = ((capacity - tokens) / rate * 1000.0).ceil() as u64;
        Ok(RateLimitResult {
            allowed: true,
            remaining,
            reset_time: now_ms + refill_ms,
            total_hits: self.policy.max_requests.saturating_sub(remaining),
        })
    }
}

#[async_trait]
impl LimiterBackend for TokenBucketLimiter {
    async fn check_limit_at(&self, identifier: &str, now_ms: u64) -> RateLimitResult {
        check_with_fail_open(
            "token_bucket",
            &self.policy,
            identifier,
            now_ms,
            self.store_timeout,
            self.try_check(identifier, now_ms),
        )
        .await
    }
}
