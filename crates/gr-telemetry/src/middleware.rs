use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::metrics::MetricsCollector;

/// Generate a 32-hex-char request correlation id (a UUID without hyphens).
pub fn generate_request_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Axum middleware that injects `X-Request-Id` and opens a per-request span.
///
/// An incoming `X-Request-Id` header is reused; otherwise a fresh id is
/// generated. The response always carries the header for correlation.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    request.headers_mut().insert(
        "x-request-id",
        request_id
            .parse()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("unknown")),
    );

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let _guard = span.enter();

    let mut response = next.run(request).await;

    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert("x-request-id", val);
    }

    response
}

/// Axum middleware recording request count and latency into the collector.
pub async fn metrics_middleware(
    State(metrics): State<Arc<MetricsCollector>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    metrics.increment_counter(
        "api_requests_total",
        &[("method", &method), ("path", &path), ("status", &status)],
    );
    metrics.record_histogram("api_request_duration_seconds", start.elapsed().as_secs_f64());

    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware as axum_middleware, routing::get, Router};
    use tower::ServiceExt;

    #[test]
    fn request_id_is_32_hex_chars() {
        let id = generate_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn response_carries_request_id() {
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum_middleware::from_fn(request_id_middleware));

        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn incoming_request_id_is_reused() {
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum_middleware::from_fn(request_id_middleware));

        let req = Request::builder()
            .uri("/ping")
            .header("x-request-id", "abc123")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "abc123");
    }

    #[tokio::test]
    async fn metrics_middleware_counts_requests() {
        let metrics = Arc::new(MetricsCollector::with_defaults());
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum_middleware::from_fn_with_state(
                metrics.clone(),
                metrics_middleware,
            ));

        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let _ = app.oneshot(req).await.unwrap();

        assert_eq!(
            metrics.get_counter(
                "api_requests_total",
                &[("method", "GET"), ("path", "/ping"), ("status", "200")]
            ),
            1
        );
    }
}
