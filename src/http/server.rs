//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware as axum_middleware, routing::get, Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::Result;
use crate::ratelimit::RateLimiter;

use super::middleware::rate_limit_middleware;

/// HTTP server applying the throttling middleware to every route except the
/// health check.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter facade
    limiter: Arc<RateLimiter>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self { addr, limiter }
    }

    /// Start the server and run until the shutdown future resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.limiter);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        Ok(())
    }
}

/// Build the application router.
///
/// The health check stays outside the throttled sub-router so probes are
/// never rejected; everything else flows through the middleware.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    let throttled = Router::new()
        .fallback(passthrough)
        .layer(axum_middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(throttled)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Placeholder downstream handler: requests that clear the limiter get an
/// acknowledgement with their quota headers attached by the middleware.
async fn passthrough(req: axum::extract::Request) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "endpoint": req.uri().path(),
    }))
}
