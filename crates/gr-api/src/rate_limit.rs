//! Rate-limit middleware for the control surface.
//!
//! Runs before authentication so floods of unauthenticated traffic are
//! throttled too. The layer resolves the Bearer token (when present) to
//! pick the role budget, stashes the principal in request extensions for
//! the auth and RBAC layers, and decorates allowed responses with the
//! `X-RateLimit-*` headers.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use tower::{Layer, Service};
use tracing::warn;

use crate::auth::{bearer_token, TokenVerifier};
use gr_core::types::AuthUser;
use gr_limiter::{EnhancedRateLimiter, RateLimitDecision, RequestMeta};

// ---------------------------------------------------------------------------
// RateLimitLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<EnhancedRateLimiter>,
    verifier: Arc<dyn TokenVerifier>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<EnhancedRateLimiter>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { limiter, verifier }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
            verifier: self.verifier.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitMiddleware
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<EnhancedRateLimiter>,
    verifier: Arc<dyn TokenVerifier>,
}

fn client_ip(req: &Request<Body>) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            req.headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let verifier = self.verifier.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let user = match bearer_token(&req) {
                Some(token) => verifier.verify(token).await,
                None => None,
            };

            let ip = client_ip(&req);
            let identity = match &user {
                Some(u) => format!("user:{}", u.user_id),
                None => format!("ip:{ip}"),
            };
            let meta = RequestMeta {
                endpoint: req.uri().path().to_string(),
                user_agent: req
                    .headers()
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from),
                ip: Some(ip),
            };

            let decision = limiter
                .check(&identity, user.as_ref().map(|u| u.role), &meta)
                .await;

            match decision {
                RateLimitDecision::Allowed {
                    limit,
                    remaining,
                    reset_secs,
                } => {
                    if let Some(user) = user {
                        req.extensions_mut().insert::<AuthUser>(user);
                    }
                    let mut response = inner.call(req).await?;
                    let headers = response.headers_mut();
                    if let Ok(v) = limit.to_string().parse() {
                        headers.insert("x-ratelimit-limit", v);
                    }
                    if let Ok(v) = remaining.to_string().parse() {
                        headers.insert("x-ratelimit-remaining", v);
                    }
                    if let Ok(v) = reset_secs.to_string().parse() {
                        headers.insert("x-ratelimit-reset", v);
                    }
                    Ok(response)
                }
                RateLimitDecision::Blocked {
                    retry_after_secs,
                    limit,
                    message,
                } => {
                    warn!(identity, endpoint = %meta.endpoint, "request rate limited");
                    let resp = (
                        StatusCode::TOO_MANY_REQUESTS,
                        [
                            ("Retry-After", retry_after_secs.to_string()),
                            ("X-RateLimit-Limit", limit.to_string()),
                            ("X-RateLimit-Remaining", "0".to_string()),
                        ],
                        axum::Json(serde_json::json!({
                            "error": "rate_limit_exceeded",
                            "retry_after": retry_after_secs,
                            "message": message,
                        })),
                    )
                        .into_response();
                    Ok(resp)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSet;
    use axum::{routing::get, Router};
    use gr_core::types::Role;
    use gr_limiter::SettingsWatcher;
    use gr_stores::MemoryKv;
    use tower::ServiceExt;

    fn app(limiter: Arc<EnhancedRateLimiter>) -> Router {
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(StaticTokenSet::new().with("admin-token", "a1", Role::Admin));
        Router::new()
            .route("/reviews/pending", get(|| async { "queue" }))
            .layer(RateLimitLayer::new(limiter, verifier))
    }

    fn limiter() -> Arc<EnhancedRateLimiter> {
        Arc::new(EnhancedRateLimiter::new(
            Arc::new(MemoryKv::new()),
            SettingsWatcher::from_defaults(),
        ))
    }

    #[tokio::test]
    async fn allowed_requests_carry_rate_headers() {
        let app = app(limiter());
        let req = Request::builder()
            .uri("/reviews/pending")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        // Unauthenticated on /reviews/pending (modifier 2.0): (20+5)·2 = 50.
        assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "50");
        assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "49");
        assert!(resp.headers().contains_key("x-ratelimit-reset"));
    }

    #[tokio::test]
    async fn authenticated_identity_uses_role_budget() {
        let app = app(limiter());
        let req = Request::builder()
            .uri("/reviews/pending")
            .header("authorization", "Bearer admin-token")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        // Admin on a 2.0 endpoint: (120+20)·2 = 280.
        assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "280");
    }

    #[tokio::test]
    async fn exhausted_budget_returns_429_with_json() {
        let limiter = limiter();
        let app = app(limiter.clone());

        for _ in 0..50 {
            let req = Request::builder()
                .uri("/reviews/pending")
                .header("x-forwarded-for", "203.0.113.10")
                .body(Body::empty())
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let req = Request::builder()
            .uri("/reviews/pending")
            .header("x-forwarded-for", "203.0.113.10")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("retry-after"));

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "rate_limit_exceeded");
        assert!(json["retry_after"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn identities_are_isolated_by_ip() {
        let app = app(limiter());
        for ip in ["203.0.113.11", "203.0.113.12"] {
            let req = Request::builder()
                .uri("/reviews/pending")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "49");
        }
    }
}
