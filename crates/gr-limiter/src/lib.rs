//! The enhanced rate limiter: per-identity sliding windows in the KV store,
//! role-weighted limits with endpoint modifiers, progressive penalties, and
//! a background alert monitor.

pub mod config;
pub mod limiter;
pub mod monitor;

pub use config::{LimiterSettings, RoleLimit, SettingsWatcher};
pub use limiter::{ClientStats, EnhancedRateLimiter, RateLimitDecision, RequestMeta};
pub use monitor::{Alert, AlertSeverity, RateLimitMonitor};
