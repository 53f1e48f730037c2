//! Request throttling middleware.
//!
//! Per request: extract the client identifier(s), resolve the endpoint
//! policy, invoke the limiter facade, then either pass the request through
//! with informational quota headers or answer 429 with structured retry
//! guidance. This layer never retries; the client is expected to retry after
//! the advertised reset.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::DateTime;
use tracing::debug;

use crate::ratelimit::{epoch_ms, RateLimiter, RateLimitResult};

/// Authenticated user identity, attached to the request by an upstream auth
/// layer. When present, checks are user-scoped; otherwise IP-scoped.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

/// axum middleware applying the configured throttling policy to a request.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let endpoint = req.uri().path().to_string();
    let ip = client_ip(&req);
    let user = user_id(&req);

    let (policy_name, policy) = limiter.resolve_policy(&endpoint);
    let limit = policy.max_requests;
    debug!(
        endpoint = %endpoint,
        policy = %policy_name,
        ip = %ip,
        user = ?user,
        "Checking request against throttling policy"
    );

    let result = limiter
        .check_request(user.as_deref(), &ip, &endpoint)
        .await;

    if !result.allowed {
        return rejection_response(limit, &result);
    }

    let mut response = next.run(req).await;
    apply_quota_headers(response.headers_mut(), limit, &result);
    response
}

/// Resolve the client IP: forwarded headers first, then the socket peer.
fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
    {
        // The first entry is the originating client.
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = req
        .headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
    {
        return real_ip.trim().to_string();
    }

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    "unknown".to_string()
}

/// Resolve the user identity: the auth extension, or the trusted front-end
/// header when no auth layer ran.
fn user_id(req: &Request) -> Option<String> {
    if let Some(AuthenticatedUser(id)) = req.extensions().get::<AuthenticatedUser>() {
        return Some(id.clone());
    }

    req.headers()
        .get("x-user-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

/// Build the standardized 429 response.
fn rejection_response(limit: u64, result: &RateLimitResult) -> Response {
    let retry_after = retry_after_seconds(result.reset_time);

    let body = Json(serde_json::json!({
        "error": "Rate limit exceeded",
        "retryAfter": retry_after,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    apply_quota_headers(headers, limit, result);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        headers.insert("Retry-After", value);
    }
    response
}

/// Attach `X-RateLimit-*` headers; set on allowed and rejected responses
/// alike.
fn apply_quota_headers(headers: &mut HeaderMap, limit: u64, result: &RateLimitResult) {
    let insert = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };

    insert(headers, "X-RateLimit-Limit", limit.to_string());
    insert(headers, "X-RateLimit-Remaining", result.remaining.to_string());
    if let Some(reset) = DateTime::from_timestamp_millis(result.reset_time as i64) {
        insert(headers, "X-RateLimit-Reset", reset.to_rfc3339());
    }
}

/// Whole seconds until the reset time, never less than one.
fn retry_after_seconds(reset_time: u64) -> u64 {
    let now = epoch_ms();
    reset_time.saturating_sub(now).div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::router;
    use crate::ratelimit::{EndpointPolicy, PolicyTable, RateLimitPolicy, Strategy};
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_router(max_requests: u64) -> axum::Router {
        let mut policies = PolicyTable::default();
        policies.endpoints = vec![EndpointPolicy {
            pattern: "translation".to_string(),
            policy: RateLimitPolicy::new(60_000, max_requests),
        }];
        let limiter = Arc::new(RateLimiter::with_policies(
            Arc::new(MemoryStore::new()),
            policies,
            Strategy::FixedWindow,
        ));
        router(limiter)
    }

    fn request(path: &str, user: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(path)
            .header("x-user-id", user)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_response_carries_quota_headers() {
        let app = test_router(5);

        let response = app
            .oneshot(request("/api/translation", "42"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "5");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "4");
        assert!(headers.contains_key("X-RateLimit-Reset"));
    }

    #[tokio::test]
    async fn test_rejection_is_429_with_structured_body() {
        let app = test_router(2);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request("/api/translation", "42"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(request("/api/translation", "42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers().clone();
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
        assert!(headers.contains_key("Retry-After"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Rate limit exceeded");
        assert!(json["retryAfter"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_users_are_throttled_independently() {
        let app = test_router(1);

        assert_eq!(
            app.clone()
                .oneshot(request("/api/translation", "1"))
                .await
                .unwrap()
                .status(),
            StatusCode::OK
        );
        assert_eq!(
            app.clone()
                .oneshot(request("/api/translation", "2"))
                .await
                .unwrap()
                .status(),
            StatusCode::OK
        );
        assert_eq!(
            app.oneshot(request("/api/translation", "1"))
                .await
                .unwrap()
                .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_forwarded_header_identifies_anonymous_clients() {
        let app = test_router(1);

        let forwarded = |ip: &str| {
            HttpRequest::builder()
                .uri("/api/translation")
                .header("x-forwarded-for", format!("{}, 172.16.0.1", ip))
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(
            app.clone().oneshot(forwarded("203.0.113.7")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            app.clone().oneshot(forwarded("203.0.113.8")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            app.oneshot(forwarded("203.0.113.7")).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_auth_extension_takes_precedence_over_header() {
        let app = test_router(1);

        let with_auth = |authenticated: &str, header: &str| {
            let mut req = HttpRequest::builder()
                .uri("/api/translation")
                .header("x-user-id", header)
                .body(Body::empty())
                .unwrap();
            req.extensions_mut()
                .insert(AuthenticatedUser(authenticated.to_string()));
            req
        };

        assert_eq!(
            app.clone()
                .oneshot(with_auth("9", "other"))
                .await
                .unwrap()
                .status(),
            StatusCode::OK
        );
        // Same authenticated identity, different header: still the same
        // budget.
        assert_eq!(
            app.oneshot(with_auth("9", "another")).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_health_endpoint_is_not_throttled() {
        let app = test_router(1);

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/health")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
