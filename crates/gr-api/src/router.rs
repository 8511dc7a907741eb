use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::auth::{is_public, AuthLayer, AuthService, TokenVerifier};
use crate::error::{ApiError, ApiResult};
use crate::rate_limit::RateLimitLayer;
use crate::rbac;
use gr_core::types::AuthUser;
use gr_core::Error;
use gr_limiter::{EnhancedRateLimiter, RateLimitMonitor};
use gr_pipeline::{EventBus, Orchestrator, PipelineEvent};
use gr_protocol::ProtocolManager;
use gr_review::{ApproveRequest, ReviewStore};
use gr_stores::{Database, DocumentStore, KeyValueStore};
use gr_telemetry::middleware::request_id_middleware;
use gr_telemetry::MetricsCollector;

// ---------------------------------------------------------------------------
// ApiState
// ---------------------------------------------------------------------------

/// Shared state for every handler. Built once at startup and passed by
/// reference; no module-level singletons.
pub struct ApiState {
    pub reviews: Arc<dyn ReviewStore>,
    pub protocol: Arc<ProtocolManager>,
    pub limiter: Arc<EnhancedRateLimiter>,
    pub monitor: Arc<RateLimitMonitor>,
    pub kv: Arc<dyn KeyValueStore>,
    pub db: Option<Database>,
    pub documents: Option<Arc<dyn DocumentStore>>,
    pub bus: EventBus,
    /// Present in the daemon; absent in surface-only deployments. Backs the
    /// development ingress endpoint.
    pub pipeline: Option<Arc<Orchestrator>>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub auth_service: Arc<dyn AuthService>,
    pub metrics: Arc<MetricsCollector>,
    pub start_time: std::time::Instant,
}

/// Build the full control-surface router: CORS → request-id → metrics →
/// rate limiter → auth → RBAC → handlers.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Auth surface.
        .route("/auth/login", post(auth_login))
        .route("/auth/callback", get(auth_callback))
        .route("/auth/refresh", post(auth_refresh))
        .route("/auth/logout", post(auth_logout))
        .route("/auth/me", get(auth_me))
        .route("/auth/sessions", get(auth_sessions))
        .route("/auth/sessions/{id}", delete(auth_revoke_session))
        // Reviews.
        .route("/reviews/pending", get(list_pending))
        .route("/reviews/{id}", get(get_review))
        .route("/reviews/{id}/claim", post(claim_review))
        .route("/reviews/{id}/approve", post(approve_review))
        .route("/reviews/{id}/reject", post(reject_review))
        // Protocol / quarantine.
        .route("/users/{user_id}/protocol", post(protocol_action))
        .route("/quarantine/messages", get(quarantine_messages))
        .route("/quarantine/batch-process", post(quarantine_batch_process))
        .route("/quarantine/stats", get(quarantine_stats))
        .route("/quarantine/audit-log", get(quarantine_audit_log))
        .route("/quarantine/cleanup", post(quarantine_cleanup))
        .route("/quarantine/{id}/process", post(quarantine_process))
        .route("/quarantine/{id}", delete(quarantine_delete))
        // Rate-limit administration.
        .route("/api/rate-limits/stats", get(rate_limit_stats))
        .route("/api/rate-limits/violations", get(rate_limit_violations))
        .route("/api/rate-limits/alerts", get(rate_limit_alerts))
        .route("/api/rate-limits/config", get(rate_limit_config))
        .route("/api/rate-limits/client/{id}", get(rate_limit_client))
        .route(
            "/api/rate-limits/client/{id}/violations",
            delete(rate_limit_clear_client),
        )
        // Development ingress: feeds the pipeline where no chat-platform
        // adapter is attached.
        .route("/internal/messages", post(ingest_message))
        // Health.
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/mcp/health", get(mcp_health))
        .route("/mcp/metrics", get(mcp_metrics))
        .layer(axum_middleware::from_fn(rbac_middleware))
        .layer(AuthLayer)
        .layer(RateLimitLayer::new(
            state.limiter.clone(),
            state.verifier.clone(),
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.metrics.clone(),
            gr_telemetry::middleware::metrics_middleware,
        ))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// RBAC middleware
// ---------------------------------------------------------------------------

async fn rbac_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    if is_public(&path) {
        return next.run(req).await;
    }

    let Some(user) = req.extensions().get::<AuthUser>().cloned() else {
        // The auth layer rejects unauthenticated requests before this; a
        // missing principal here is still a refusal.
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "detail": "missing or invalid token" })),
        )
            .into_response();
    };

    if !rbac::allowed(user.role, &method, &path) {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "detail": format!("role {} may not {} {}", user.role.as_str(), method, path)
            })),
        )
            .into_response();
    }

    next.run(req).await
}

// ---------------------------------------------------------------------------
// Auth handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LoginBody {
    provider: String,
    redirect_url: Option<String>,
}

async fn auth_login(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<LoginBody>,
) -> ApiResult<impl IntoResponse> {
    let start = state
        .auth_service
        .begin_login(&body.provider, body.redirect_url.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "auth_url": start.auth_url,
        "state": start.state,
    })))
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn auth_callback(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Response> {
    if let Some(error) = query.error {
        return Err(ApiError(Error::Auth(format!("provider error: {error}"))));
    }
    let (code, oauth_state) = match (query.code, query.state) {
        (Some(c), Some(s)) => (c, s),
        _ => {
            return Err(ApiError(Error::Validation(
                "code and state are required".into(),
            )))
        }
    };
    let redirect = state
        .auth_service
        .complete_callback(&code, &oauth_state)
        .await?;
    Ok(Redirect::temporary(&redirect).into_response())
}

#[derive(Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

async fn auth_refresh(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<RefreshBody>,
) -> ApiResult<impl IntoResponse> {
    let pair = state.auth_service.refresh(&body.refresh_token).await?;
    Ok(Json(pair))
}

async fn auth_logout(
    State(state): State<Arc<ApiState>>,
    headers: axum::http::HeaderMap,
) -> ApiResult<impl IntoResponse> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        state.auth_service.logout(token).await?;
    }
    Ok(Json(serde_json::json!({ "status": "logged_out" })))
}

async fn auth_me(Extension(user): Extension<AuthUser>) -> impl IntoResponse {
    Json(user)
}

async fn auth_sessions(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let sessions = state.auth_service.sessions(&user).await?;
    Ok(Json(sessions))
}

async fn auth_revoke_session(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let revoked = state.auth_service.revoke_session(&user, id).await?;
    if revoked {
        Ok(Json(serde_json::json!({ "status": "revoked" })))
    } else {
        Err(ApiError(Error::Conflict(format!("session {id} not found"))))
    }
}

// ---------------------------------------------------------------------------
// Review handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PendingQuery {
    limit: Option<usize>,
    min_priority: Option<f64>,
}

async fn list_pending(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<impl IntoResponse> {
    let interactions = state
        .reviews
        .list_pending(query.limit.unwrap_or(50).min(500), query.min_priority.unwrap_or(0.0))
        .await?;
    Ok(Json(interactions))
}

async fn get_review(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let interaction = state
        .reviews
        .get(id)
        .await?
        .ok_or_else(|| Error::Conflict(format!("interaction {id} not found")))?;
    Ok(Json(interaction))
}

async fn claim_review(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let interaction = state.reviews.claim(id, &user.user_id).await?;
    Ok(Json(interaction))
}

#[derive(Deserialize)]
struct ApproveBody {
    final_bubbles: Vec<String>,
    #[serde(default)]
    edit_tags: Vec<String>,
    quality_score: Option<i16>,
    reviewer_notes: Option<String>,
}

async fn approve_review(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveBody>,
) -> ApiResult<impl IntoResponse> {
    let interaction = state
        .reviews
        .approve(
            id,
            &user.user_id,
            ApproveRequest {
                final_bubbles: body.final_bubbles,
                edit_tags: body.edit_tags,
                quality_score: body.quality_score,
                reviewer_notes: body.reviewer_notes,
            },
        )
        .await?;

    // Signal the delivery worker in approval order.
    state.bus.publish(PipelineEvent::Approved { interaction_id: id });
    info!(interaction_id = %id, reviewer = %user.user_id, "approval published");
    Ok(Json(interaction))
}

#[derive(Deserialize)]
struct RejectBody {
    reviewer_notes: Option<String>,
}

async fn reject_review(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> ApiResult<impl IntoResponse> {
    let interaction = state
        .reviews
        .reject(id, &user.user_id, body.reviewer_notes)
        .await?;
    Ok(Json(interaction))
}

// ---------------------------------------------------------------------------
// Protocol / quarantine handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ProtocolQuery {
    action: String,
    reason: Option<String>,
}

async fn protocol_action(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthUser>,
    Path(user_id): Path<String>,
    Query(query): Query<ProtocolQuery>,
) -> ApiResult<impl IntoResponse> {
    let reason = query.reason.as_deref().unwrap_or("unspecified");
    match query.action.as_str() {
        "activate" => {
            let protocol_state = state
                .protocol
                .activate(&user_id, &user.user_id, reason)
                .await?;
            Ok(Json(serde_json::json!({ "status": protocol_state.status })))
        }
        "deactivate" => {
            let protocol_state = state
                .protocol
                .deactivate(&user_id, &user.user_id, reason)
                .await?;
            Ok(Json(serde_json::json!({ "status": protocol_state.status })))
        }
        "one_time_pass" => {
            state.protocol.one_time_pass(&user_id, &user.user_id).await?;
            Ok(Json(serde_json::json!({ "status": "pass_granted" })))
        }
        other => Err(ApiError(Error::Validation(format!(
            "unknown protocol action '{other}'"
        )))),
    }
}

#[derive(Deserialize)]
struct MessagesQuery {
    user_id: Option<String>,
    limit: Option<usize>,
}

async fn quarantine_messages(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let messages = state
        .protocol
        .list_messages(query.user_id.as_deref(), query.limit.unwrap_or(50).min(500))
        .await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct ProcessQuery {
    action: Option<String>,
}

async fn quarantine_process(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(query): Query<ProcessQuery>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .protocol
        .get_message(id)
        .await?
        .ok_or_else(|| Error::Conflict(format!("quarantine message {id} not found")))?;

    let processed = state.protocol.process_messages(&[id], &user.user_id).await?;

    if query.action.as_deref() == Some("process_and_deactivate") {
        state
            .protocol
            .deactivate(&message.user_id, &user.user_id, "processed from quarantine")
            .await?;
    }

    Ok(Json(serde_json::json!({ "processed": processed })))
}

async fn quarantine_batch_process(
    State(state): State<Arc<ApiState>>,
    Extension(user): Extension<AuthUser>,
    Json(ids): Json<Vec<Uuid>>,
) -> ApiResult<impl IntoResponse> {
    let processed = state.protocol.process_messages(&ids, &user.user_id).await?;
    Ok(Json(serde_json::json!({ "processed": processed })))
}

async fn quarantine_delete(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state.protocol.delete_messages(&[id]).await?;
    if deleted == 0 {
        return Err(ApiError(Error::Conflict(format!(
            "quarantine message {id} not found"
        ))));
    }
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn quarantine_stats(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    let stats = state.protocol.stats().await?;
    Ok(Json(stats))
}

async fn quarantine_audit_log(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let entries = state
        .protocol
        .audit_log(query.user_id.as_deref(), query.limit.unwrap_or(100).min(500))
        .await?;
    Ok(Json(entries))
}

async fn quarantine_cleanup(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    let purged = state.protocol.cleanup_expired().await?;
    Ok(Json(serde_json::json!({ "purged": purged })))
}

// ---------------------------------------------------------------------------
// Rate-limit admin handlers
// ---------------------------------------------------------------------------

async fn rate_limit_stats(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    let violations = state.limiter.recent_violations(1000).await?;
    let alerts = state.monitor.recent_alerts(100).await;
    Ok(Json(serde_json::json!({
        "recent_violations": violations.len(),
        "recent_alerts": alerts.len(),
    })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn rate_limit_violations(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let violations = state
        .limiter
        .recent_violations(query.limit.unwrap_or(100).min(1000))
        .await?;
    Ok(Json(violations))
}

async fn rate_limit_alerts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let alerts = state
        .monitor
        .recent_alerts(query.limit.unwrap_or(100).min(100))
        .await;
    Ok(Json(alerts))
}

async fn rate_limit_config(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.limiter.settings().as_ref().clone()))
}

async fn rate_limit_client(
    State(state): State<Arc<ApiState>>,
    Path(identity): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let stats = state.limiter.client_stats(&identity).await?;
    Ok(Json(stats))
}

async fn rate_limit_clear_client(
    State(state): State<Arc<ApiState>>,
    Path(identity): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.limiter.clear_violations(&identity).await?;
    Ok(Json(serde_json::json!({ "status": "cleared" })))
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct IngestBody {
    user_id: String,
    text: String,
    external_message_id: Option<String>,
}

async fn ingest_message(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<IngestBody>,
) -> ApiResult<impl IntoResponse> {
    let Some(pipeline) = &state.pipeline else {
        return Err(ApiError(Error::Validation(
            "no pipeline attached to this surface".into(),
        )));
    };
    if body.user_id.trim().is_empty() || body.text.trim().is_empty() {
        return Err(ApiError(Error::Validation(
            "user_id and text are required".into(),
        )));
    }

    let mut message = gr_core::types::InboundMessage::new(body.user_id, body.text);
    message.external_message_id = body.external_message_id;
    pipeline.submit(message)?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "queued" }))))
}

// ---------------------------------------------------------------------------
// Health handlers
// ---------------------------------------------------------------------------

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn dependency_checks(state: &ApiState) -> (bool, serde_json::Value) {
    let kv_ok = state.kv.ping().await.is_ok();
    let db_status = match &state.db {
        Some(db) => {
            if db.ping().await.is_ok() {
                "ok"
            } else {
                "down"
            }
        }
        None => "not_configured",
    };
    let documents_status = match &state.documents {
        Some(documents) => {
            if documents.ping().await.is_ok() {
                "ok"
            } else {
                "down"
            }
        }
        None => "not_configured",
    };

    let healthy = kv_ok && db_status != "down" && documents_status != "down";
    let body = serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "dependencies": {
            "kv": if kv_ok { "ok" } else { "down" },
            "database": db_status,
            "documents": documents_status,
        },
    });
    (healthy, body)
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let (healthy, body) = dependency_checks(&state).await;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Deserialize)]
struct McpHealthQuery {
    cmd: Option<String>,
}

async fn mcp_health(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<McpHealthQuery>,
) -> ApiResult<impl IntoResponse> {
    let cmd = query.cmd.unwrap_or_else(|| "status".to_string());
    let (_, body) = dependency_checks(&state).await;

    // Keep a short per-command history for the dashboard.
    let record = serde_json::json!({
        "cmd": cmd,
        "result": body,
        "at": chrono::Utc::now().to_rfc3339(),
    });
    state
        .kv
        .lpush_capped(&format!("mcp_health_{cmd}"), &record.to_string(), 50)
        .await
        .map_err(Error::from)?;

    Ok(Json(body))
}

async fn mcp_metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticTokenSet, StubAuthService};
    use axum::body::Body;
    use axum::http::Request;
    use gr_core::config::ProtocolConfig;
    use gr_core::types::{InboundMessage, Interaction, Role};
    use gr_limiter::SettingsWatcher;
    use gr_protocol::InMemoryProtocolStore;
    use gr_review::InMemoryReviewStore;
    use gr_stores::MemoryKv;
    use tower::ServiceExt;

    struct TestApi {
        router: Router,
        state: Arc<ApiState>,
        reviews: Arc<InMemoryReviewStore>,
    }

    fn api() -> TestApi {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        let reviews = Arc::new(InMemoryReviewStore::new());
        let mut protocol_config = ProtocolConfig::default();
        protocol_config.state_cache_secs = 0;
        let protocol = Arc::new(ProtocolManager::new(
            Arc::new(InMemoryProtocolStore::new()),
            protocol_config,
        ));
        let limiter = Arc::new(EnhancedRateLimiter::new(
            kv.clone(),
            SettingsWatcher::from_defaults(),
        ));
        let monitor = Arc::new(RateLimitMonitor::new(kv.clone()));
        let verifier: Arc<dyn TokenVerifier> = Arc::new(
            StaticTokenSet::new()
                .with("admin-token", "admin1", Role::Admin)
                .with("rev-a-token", "rev_a", Role::Reviewer)
                .with("rev-b-token", "rev_b", Role::Reviewer)
                .with("viewer-token", "viewer1", Role::Viewer),
        );

        let state = Arc::new(ApiState {
            reviews: reviews.clone(),
            protocol,
            limiter,
            monitor,
            kv,
            db: None,
            documents: None,
            bus: EventBus::new(),
            pipeline: None,
            verifier,
            auth_service: Arc::new(StubAuthService),
            metrics: Arc::new(MetricsCollector::with_defaults()),
            start_time: std::time::Instant::now(),
        });

        TestApi {
            router: api_router(state.clone()),
            state,
            reviews,
        }
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    }

    async fn stage_pending(reviews: &InMemoryReviewStore, user: &str) -> Uuid {
        let mut i = Interaction::pending(user, "hello", "raw", vec!["hi".into()]);
        i.priority_score = 0.5;
        reviews.stage(&i).await.unwrap()
    }

    #[tokio::test]
    async fn protected_routes_require_a_token() {
        let api = api();
        let resp = api
            .router
            .oneshot(request("GET", "/reviews/pending", None, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let api = api();
        let resp = api
            .router
            .oneshot(request("GET", "/healthz", None, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn pending_queue_lists_in_priority_order() {
        let api = api();
        stage_pending(&api.reviews, "u1").await;
        stage_pending(&api.reviews, "u2").await;

        let resp = api
            .router
            .oneshot(request(
                "GET",
                "/reviews/pending?limit=10",
                Some("viewer-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn claim_approve_flow_publishes_delivery_event() {
        let api = api();
        let id = stage_pending(&api.reviews, "u1").await;
        let bus_rx = api.state.bus.subscribe();

        let resp = api
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/reviews/{id}/claim"),
                Some("rev-a-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = api
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/reviews/{id}/approve"),
                Some("rev-a-token"),
                Some(serde_json::json!({
                    "final_bubbles": ["hi", "how are you"],
                    "edit_tags": [],
                    "quality_score": 4,
                })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["review_status"], "approved");

        assert_eq!(
            bus_rx.recv().unwrap(),
            PipelineEvent::Approved { interaction_id: id }
        );
    }

    #[tokio::test]
    async fn second_claim_conflicts_with_409() {
        let api = api();
        let id = stage_pending(&api.reviews, "u1").await;

        let resp = api
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/reviews/{id}/claim"),
                Some("rev-a-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = api
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/reviews/{id}/claim"),
                Some("rev-b-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // The original claimer's approve still succeeds.
        let resp = api
            .router
            .oneshot(request(
                "POST",
                &format!("/reviews/{id}/approve"),
                Some("rev-a-token"),
                Some(serde_json::json!({ "final_bubbles": ["ok"] })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn viewer_cannot_approve() {
        let api = api();
        let id = stage_pending(&api.reviews, "u1").await;

        let resp = api
            .router
            .oneshot(request(
                "POST",
                &format!("/reviews/{id}/approve"),
                Some("viewer-token"),
                Some(serde_json::json!({ "final_bubbles": ["hi"] })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn protocol_activation_is_admin_only_and_diverts() {
        let api = api();

        // A reviewer may not manage the protocol.
        let resp = api
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/users/u2/protocol?action=activate&reason=spam",
                Some("rev-a-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = api
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/users/u2/protocol?action=activate&reason=spam",
                Some("admin-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // The next message from u2 diverts; stats reflect it.
        api.state
            .protocol
            .check_inbound(&InboundMessage::new("u2", "hey"))
            .await
            .unwrap();

        let resp = api
            .router
            .oneshot(request(
                "GET",
                "/quarantine/stats",
                Some("admin-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["total_messages_quarantined"], 1);
        assert!((body["cost_saved_24h"].as_f64().unwrap() - 0.000307).abs() < 1e-9);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected_with_400() {
        let api = api();
        let ids: Vec<String> = (0..101).map(|_| Uuid::new_v4().to_string()).collect();

        let resp = api
            .router
            .oneshot(request(
                "POST",
                "/quarantine/batch-process?action=process",
                Some("rev-a-token"),
                Some(serde_json::json!(ids)),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limit_admin_surface_is_gated() {
        let api = api();

        let resp = api
            .router
            .clone()
            .oneshot(request(
                "GET",
                "/api/rate-limits/config",
                Some("rev-a-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = api
            .router
            .oneshot(request(
                "GET",
                "/api/rate-limits/config",
                Some("admin-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["unauthenticated"]["requests_per_minute"], 20);
    }

    #[tokio::test]
    async fn responses_carry_rate_limit_headers() {
        let api = api();
        let resp = api
            .router
            .oneshot(request(
                "GET",
                "/reviews/pending",
                Some("viewer-token"),
                None,
            ))
            .await
            .unwrap();
        assert!(resp.headers().contains_key("x-ratelimit-limit"));
        assert!(resp.headers().contains_key("x-ratelimit-remaining"));
        assert!(resp.headers().contains_key("x-ratelimit-reset"));
        assert!(resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn auth_me_reflects_the_token() {
        let api = api();
        let resp = api
            .router
            .oneshot(request("GET", "/auth/me", Some("rev-a-token"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["user_id"], "rev_a");
        assert_eq!(body["role"], "reviewer");
    }

    #[tokio::test]
    async fn unknown_protocol_action_is_400() {
        let api = api();
        let resp = api
            .router
            .oneshot(request(
                "POST",
                "/users/u1/protocol?action=explode",
                Some("admin-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mcp_health_records_history() {
        let api = api();
        let resp = api
            .router
            .oneshot(request(
                "GET",
                "/mcp/health?cmd=status",
                Some("viewer-token"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let history = api.state.kv.lrange("mcp_health_status", 0, -1).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn mcp_metrics_exports_prometheus_text() {
        let api = api();
        let resp = api
            .router
            .oneshot(request("GET", "/mcp/metrics", Some("viewer-token"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("# TYPE"));
    }
}
