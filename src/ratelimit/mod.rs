//! Rate limiting strategies, policy resolution, and the limiter facade.

mod fixed_window;
mod limiter;
mod policy;
mod sliding_window;
mod strategy;
mod token_bucket;

pub(crate) use strategy::epoch_ms;

pub use fixed_window::FixedWindowLimiter;
pub use limiter::RateLimiter;
pub use policy::{EndpointPolicy, PolicyTable, RateLimitPolicy, Strategy};
pub use sliding_window::SlidingWindowLimiter;
pub use strategy::{LimiterBackend, RateLimitResult};
pub use token_bucket::TokenBucketLimiter;
