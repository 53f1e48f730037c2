//! HTTP server and throttling middleware.

mod middleware;
mod server;

pub use middleware::{rate_limit_middleware, AuthenticatedUser};
pub use server::{router, HttpServer};
