//! Key-value store adapters backing the limiter strategies.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by a key-value store adapter.
///
/// Limiters never surface these to callers; every store error is converted
/// into a fail-open decision at the limiter boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or did not respond in time
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Redis protocol or connection errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored state could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Minimal async key-value interface consumed by all limiter strategies.
///
/// Implementations must provide atomic `increment` semantics: concurrent
/// increments of the same key from multiple service instances must serialize
/// through the store, since the limiters hold no in-process locks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the value for a key, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value with a time-to-live in seconds.
    async fn set_with_expiry(
        &self,
        key: &str,
        ttl_seconds: u64,
        value: &str,
    ) -> Result<(), StoreError>;

    /// Atomically increment a counter, creating it at zero first if absent.
    /// Returns the post-increment value.
    async fn increment(&self, key: &str) -> Result<u64, StoreError>;

    /// Set a time-to-live on an existing key.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StoreError>;

    /// Delete keys, returning the number removed.
    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError>;
}
