//! Bearer-token authentication for the control surface.
//!
//! The rate-limit layer (which runs first) resolves the token and stashes
//! the principal in request extensions; this layer enforces that protected
//! routes actually carry one. A legacy static dashboard key maps to an
//! implicit admin identity and logs a deprecation warning on every use.

use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::warn;
use uuid::Uuid;

use gr_core::types::{AuthUser, Role};
use gr_core::{Error, Result};

// ---------------------------------------------------------------------------
// TokenVerifier
// ---------------------------------------------------------------------------

/// Resolves a Bearer token to a principal. JWT validation and OAuth flows
/// live behind this seam.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<AuthUser>;
}

/// The legacy static dashboard key. Matching tokens become an implicit
/// admin; every use is flagged for migration.
pub struct StaticKeyVerifier {
    key: Option<String>,
}

impl StaticKeyVerifier {
    pub fn new(key: Option<String>) -> Self {
        Self { key }
    }
}

#[async_trait]
impl TokenVerifier for StaticKeyVerifier {
    async fn verify(&self, token: &str) -> Option<AuthUser> {
        let key = self.key.as_ref()?;
        if bool::from(token.as_bytes().ct_eq(key.as_bytes())) {
            warn!("deprecated static dashboard key used – migrate this client to OAuth tokens");
            Some(AuthUser {
                user_id: "dashboard-admin".into(),
                role: Role::Admin,
            })
        } else {
            None
        }
    }
}

/// Fixed token → principal table, for tests and development.
#[derive(Default)]
pub struct StaticTokenSet {
    tokens: Vec<(String, AuthUser)>,
}

impl StaticTokenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, user_id: impl Into<String>, role: Role) -> Self {
        self.tokens.push((
            token.into(),
            AuthUser {
                user_id: user_id.into(),
                role,
            },
        ));
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenSet {
    async fn verify(&self, token: &str) -> Option<AuthUser> {
        self.tokens
            .iter()
            .find(|(t, _)| bool::from(t.as_bytes().ct_eq(token.as_bytes())))
            .map(|(_, user)| user.clone())
    }
}

/// Tries each verifier in order; first match wins.
pub struct CompositeVerifier {
    verifiers: Vec<Arc<dyn TokenVerifier>>,
}

impl CompositeVerifier {
    pub fn new(verifiers: Vec<Arc<dyn TokenVerifier>>) -> Self {
        Self { verifiers }
    }
}

#[async_trait]
impl TokenVerifier for CompositeVerifier {
    async fn verify(&self, token: &str) -> Option<AuthUser> {
        for verifier in &self.verifiers {
            if let Some(user) = verifier.verify(token).await {
                return Some(user);
            }
        }
        None
    }
}

/// Pull the Bearer token from an Authorization header value.
pub fn bearer_token(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Routes reachable without a token.
pub fn is_public(path: &str) -> bool {
    matches!(path, "/auth/login" | "/auth/callback" | "/auth/refresh" | "/health" | "/healthz")
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LoginStart {
    pub auth_url: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub user: AuthUser,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
}

/// The OAuth/session collaborator behind the `/auth/*` endpoints. The
/// provider handshake itself is external; this trait is the boundary.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn begin_login(&self, provider: &str, redirect_url: Option<&str>) -> Result<LoginStart>;
    /// Returns the frontend URL to redirect to, tokens in the fragment.
    async fn complete_callback(&self, code: &str, state: &str) -> Result<String>;
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair>;
    async fn logout(&self, token: &str) -> Result<()>;
    async fn sessions(&self, user: &AuthUser) -> Result<Vec<SessionInfo>>;
    async fn revoke_session(&self, user: &AuthUser, session_id: Uuid) -> Result<bool>;
}

/// Placeholder until an OAuth provider integration is wired in.
#[derive(Debug, Default)]
pub struct StubAuthService;

#[async_trait]
impl AuthService for StubAuthService {
    async fn begin_login(&self, provider: &str, _redirect_url: Option<&str>) -> Result<LoginStart> {
        Err(Error::Validation(format!(
            "auth provider {provider} is not configured"
        )))
    }

    async fn complete_callback(&self, _code: &str, _state: &str) -> Result<String> {
        Err(Error::Validation("auth provider is not configured".into()))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair> {
        Err(Error::Auth("invalid refresh token".into()))
    }

    async fn logout(&self, _token: &str) -> Result<()> {
        Ok(())
    }

    async fn sessions(&self, _user: &AuthUser) -> Result<Vec<SessionInfo>> {
        Ok(Vec::new())
    }

    async fn revoke_session(&self, _user: &AuthUser, _session_id: Uuid) -> Result<bool> {
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// Rejects protected routes whose request carries no resolved principal.
#[derive(Clone)]
pub struct AuthLayer;

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware { inner }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if is_public(req.uri().path()) || req.extensions().get::<AuthUser>().is_some() {
                return inner.call(req).await;
            }

            let resp = (
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({ "detail": "missing or invalid token" })),
            )
                .into_response();
            Ok(resp)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
