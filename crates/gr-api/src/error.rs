//! HTTP error mapping.
//!
//! Handlers return [`ApiError`]; the `IntoResponse` impl turns the shared
//! taxonomy into a status code plus a `{"detail": …}` body. Internal
//! failures never leak their message to the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub gr_core::Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail, headers) = match &self.0 {
            gr_core::Error::Validation(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), Vec::new())
            }
            gr_core::Error::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone(), Vec::new()),
            gr_core::Error::Conflict(msg) => {
                let status = if msg.contains("not found") {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::CONFLICT
                };
                (status, msg.clone(), Vec::new())
            }
            gr_core::Error::Transient(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone(), Vec::new())
            }
            gr_core::Error::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate limited".to_string(),
                vec![("Retry-After".to_string(), retry_after_secs.to_string())],
            ),
            gr_core::Error::Failure(msg) => {
                error!(detail = %msg, "internal error surfaced at the HTTP boundary");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                    Vec::new(),
                )
            }
        };

        let mut response = (status, Json(json!({ "detail": detail }))).into_response();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<axum::http::HeaderName>(),
                value.parse::<axum::http::HeaderValue>(),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn validation_maps_to_400() {
        let resp = ApiError(gr_core::Error::Validation("bad body".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_of(resp).await.contains("bad body"));
    }

    #[tokio::test]
    async fn conflict_maps_to_409_or_404() {
        let resp = ApiError(gr_core::Error::Conflict("already claimed".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp =
            ApiError(gr_core::Error::Conflict("interaction 42 not found".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rate_limited_carries_retry_after() {
        let resp = ApiError(gr_core::Error::RateLimited {
            retry_after_secs: 120,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "120");
    }

    #[tokio::test]
    async fn failures_do_not_leak_detail() {
        let resp =
            ApiError(gr_core::Error::Failure("secret stack trace".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(resp).await;
        assert!(!body.contains("secret"));
        assert!(body.contains("internal error"));
    }
}
