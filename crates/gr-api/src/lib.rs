//! The HTTP control surface: authenticated, role-checked, rate-limited
//! endpoints exposing the review queue, the quarantine protocol, and the
//! rate limiter to reviewers.

pub mod auth;
pub mod error;
pub mod rate_limit;
pub mod rbac;
pub mod router;

pub use auth::{AuthLayer, AuthService, StaticKeyVerifier, StaticTokenSet, StubAuthService, TokenVerifier};
pub use error::ApiError;
pub use rate_limit::RateLimitLayer;
pub use router::{api_router, ApiState};
