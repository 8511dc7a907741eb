use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{RoleLimit, SettingsWatcher};
use gr_core::types::Role;
use gr_core::{Error, Result};
use gr_stores::KeyValueStore;

const DAY_SECS: u64 = 86_400;
const WEEK_SECS: u64 = 7 * DAY_SECS;
/// Monitoring feed: most recent violations, capped.
pub(crate) const VIOLATION_FEED_KEY: &str = "rate_limit:metrics:rate_limit_violation";
const VIOLATION_FEED_CAP: usize = 1000;

// ---------------------------------------------------------------------------
// Decision / metadata
// ---------------------------------------------------------------------------

/// Per-request metadata recorded with violations.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub endpoint: String,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

impl RequestMeta {
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            user_agent: None,
            ip: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_secs: u64,
    },
    Blocked {
        retry_after_secs: u64,
        limit: u32,
        message: String,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Introspection payload for one client identity.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub identity: String,
    pub blocked: bool,
    pub blocked_until: Option<u64>,
    pub violations_24h: Vec<serde_json::Value>,
    pub current_minute_usage: u32,
}

// ---------------------------------------------------------------------------
// EnhancedRateLimiter
// ---------------------------------------------------------------------------

type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

/// KV-backed sliding-window limiter with role weights, endpoint modifiers,
/// and progressive penalties.
///
/// Counters live in the shared KV store (atomic INCR+EXPIRE pipelines), so
/// any number of processes enforce the same budget. When the KV store is
/// unreachable the limiter fails open and logs at error level — requests
/// are never dropped because the limiter itself is down.
pub struct EnhancedRateLimiter {
    kv: Arc<dyn KeyValueStore>,
    settings: SettingsWatcher,
    clock: Clock,
}

fn wall_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl EnhancedRateLimiter {
    pub fn new(kv: Arc<dyn KeyValueStore>, settings: SettingsWatcher) -> Self {
        Self {
            kv,
            settings,
            clock: Box::new(wall_clock),
        }
    }

    /// Test hook: pin the clock.
    pub fn with_clock(
        kv: Arc<dyn KeyValueStore>,
        settings: SettingsWatcher,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            kv,
            settings,
            clock: Box::new(clock),
        }
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    /// The current configuration snapshot (reloading if the file changed).
    pub fn settings(&self) -> std::sync::Arc<crate::config::LimiterSettings> {
        self.settings.current()
    }

    // -- the per-request check ---------------------------------------------

    /// Check one request for `identity` (`user:{id}` or `ip:{addr}`). Never
    /// errors: KV failures fail open.
    pub async fn check(
        &self,
        identity: &str,
        role: Option<Role>,
        meta: &RequestMeta,
    ) -> RateLimitDecision {
        let config = self.settings.current().effective(role, &meta.endpoint);
        match self.check_inner(identity, &config, meta).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    identity,
                    endpoint = %meta.endpoint,
                    error = %e,
                    "rate limiter store unavailable – failing open"
                );
                RateLimitDecision::Allowed {
                    limit: config.requests_per_minute + config.burst_allowance,
                    remaining: config.requests_per_minute + config.burst_allowance,
                    reset_secs: 60,
                }
            }
        }
    }

    /// Outbound AI-provider traffic shares the same machinery under a
    /// provider-specific identity.
    pub async fn check_provider(&self, provider: &str) -> RateLimitDecision {
        let config = self.settings.current().provider.clone();
        let identity = format!("provider:{provider}");
        let meta = RequestMeta::for_endpoint("provider");
        match self.check_inner(&identity, &config, &meta).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(provider, error = %e, "provider limiter store unavailable – failing open");
                RateLimitDecision::Allowed {
                    limit: config.requests_per_minute + config.burst_allowance,
                    remaining: config.requests_per_minute + config.burst_allowance,
                    reset_secs: 60,
                }
            }
        }
    }

    async fn check_inner(
        &self,
        identity: &str,
        config: &RoleLimit,
        meta: &RequestMeta,
    ) -> Result<RateLimitDecision> {
        let now = self.now();
        let effective_limit = config.requests_per_minute + config.burst_allowance;

        // Request counter for the alert monitor. Best-effort.
        let _ = self
            .kv
            .incr_with_expiry(
                &format!("rate_limit:stats:requests:{}", now / 60),
                Duration::from_secs(900),
            )
            .await;

        // Standing block?
        let block_key = format!("rate_limit:{identity}:blocked");
        if let Some(raw) = self.kv.get(&block_key).await.map_err(Error::from)? {
            if let Ok(blocked_until) = raw.parse::<u64>() {
                if now < blocked_until {
                    self.count_blocked(now).await;
                    return Ok(RateLimitDecision::Blocked {
                        retry_after_secs: blocked_until - now,
                        limit: effective_limit,
                        message: "Too many requests. Please try again later.".into(),
                    });
                }
            }
            // Expired or garbage: clean up.
            self.kv.del(&block_key).await.map_err(Error::from)?;
        }

        // Count this request in the minute window.
        let window_key = format!("rate_limit:{identity}:window:{}", now / 60);
        let count = self
            .kv
            .incr_with_expiry(&window_key, Duration::from_secs(120))
            .await
            .map_err(Error::from)?;

        if count > effective_limit as i64 {
            let penalty_minutes = self.penalty_minutes(identity, config, now).await;
            let blocked_until = now + penalty_minutes * 60;
            self.kv
                .set_ex(
                    &block_key,
                    &blocked_until.to_string(),
                    Duration::from_secs(penalty_minutes * 60),
                )
                .await
                .map_err(Error::from)?;

            self.record_violation(identity, meta, penalty_minutes, now)
                .await?;
            self.count_blocked(now).await;

            warn!(
                identity,
                endpoint = %meta.endpoint,
                count,
                limit = effective_limit,
                penalty_minutes,
                "rate limit exceeded"
            );
            return Ok(RateLimitDecision::Blocked {
                retry_after_secs: penalty_minutes * 60,
                limit: effective_limit,
                message: format!("Rate limit exceeded. Blocked for {penalty_minutes} minutes."),
            });
        }

        if count as f64 > effective_limit as f64 * 0.8 {
            info!(
                identity,
                endpoint = %meta.endpoint,
                count,
                limit = effective_limit,
                "client approaching rate limit"
            );
        }

        Ok(RateLimitDecision::Allowed {
            limit: effective_limit,
            remaining: (effective_limit as i64 - count).max(0) as u32,
            reset_secs: 60 - (now % 60),
        })
    }

    async fn penalty_minutes(&self, identity: &str, config: &RoleLimit, now: u64) -> u64 {
        if !config.progressive_backoff {
            return config.violation_penalty_minutes as u64;
        }
        let violations_key = format!("rate_limit:{identity}:violations");
        let prior = self
            .kv
            .zcount(&violations_key, (now - DAY_SECS) as f64, f64::INFINITY)
            .await
            .unwrap_or(0) as u32;
        let doubled = (config.violation_penalty_minutes as u64)
            .saturating_mul(2u64.saturating_pow(prior));
        doubled.min(config.max_penalty_minutes as u64)
    }

    async fn record_violation(
        &self,
        identity: &str,
        meta: &RequestMeta,
        penalty_minutes: u64,
        now: u64,
    ) -> Result<()> {
        let violations_key = format!("rate_limit:{identity}:violations");
        let record = serde_json::json!({
            "endpoint": meta.endpoint,
            "timestamp": now,
            "penalty_minutes": penalty_minutes,
            "user_agent": meta.user_agent.as_deref().unwrap_or("unknown"),
            "ip": meta.ip.as_deref().unwrap_or("unknown"),
        })
        .to_string();

        self.kv
            .zadd(&violations_key, now as f64, &record)
            .await
            .map_err(Error::from)?;
        self.kv
            .zremrangebyscore(&violations_key, f64::NEG_INFINITY, (now - WEEK_SECS) as f64)
            .await
            .map_err(Error::from)?;
        self.kv
            .expire(&violations_key, Duration::from_secs(WEEK_SECS))
            .await
            .map_err(Error::from)?;

        // Global monitoring feed for the alert monitor and the admin API.
        let feed_record = serde_json::json!({
            "identity": identity,
            "endpoint": meta.endpoint,
            "timestamp": now,
            "penalty_minutes": penalty_minutes,
        })
        .to_string();
        self.kv
            .lpush_capped(VIOLATION_FEED_KEY, &feed_record, VIOLATION_FEED_CAP)
            .await
            .map_err(Error::from)?;
        self.kv
            .expire(VIOLATION_FEED_KEY, Duration::from_secs(DAY_SECS))
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn count_blocked(&self, now: u64) {
        let _ = self
            .kv
            .incr_with_expiry(
                &format!("rate_limit:stats:blocked:{}", now / 60),
                Duration::from_secs(900),
            )
            .await;
    }

    // -- introspection ------------------------------------------------------

    pub async fn client_stats(&self, identity: &str) -> Result<ClientStats> {
        let now = self.now();
        let blocked_until = self
            .kv
            .get(&format!("rate_limit:{identity}:blocked"))
            .await
            .map_err(Error::from)?
            .and_then(|v| v.parse::<u64>().ok());

        let violations = self
            .kv
            .zrangebyscore(
                &format!("rate_limit:{identity}:violations"),
                (now - DAY_SECS) as f64,
                f64::INFINITY,
            )
            .await
            .map_err(Error::from)?;
        let violations_24h = violations
            .iter()
            .filter_map(|v| serde_json::from_str(v).ok())
            .collect();

        let usage = self
            .kv
            .get(&format!("rate_limit:{identity}:window:{}", now / 60))
            .await
            .map_err(Error::from)?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        Ok(ClientStats {
            identity: identity.to_string(),
            blocked: blocked_until.is_some_and(|until| now < until),
            blocked_until,
            violations_24h,
            current_minute_usage: usage,
        })
    }

    /// Forgive a client: drop its violation history and any standing block.
    pub async fn clear_violations(&self, identity: &str) -> Result<()> {
        self.kv
            .del(&format!("rate_limit:{identity}:violations"))
            .await
            .map_err(Error::from)?;
        self.kv
            .del(&format!("rate_limit:{identity}:blocked"))
            .await
            .map_err(Error::from)?;
        info!(identity, "violation history cleared");
        Ok(())
    }

    /// The most recent entries from the global violation feed.
    pub async fn recent_violations(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        let raw = self
            .kv
            .lrange(VIOLATION_FEED_KEY, 0, limit.saturating_sub(1) as isize)
            .await
            .map_err(Error::from)?;
        Ok(raw
            .iter()
            .filter_map(|v| serde_json::from_str(v).ok())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterSettings;
    use gr_stores::MemoryKv;

    const NOW: u64 = 1_700_000_000 - (1_700_000_000 % 60) + 10;

    fn limiter(kv: Arc<dyn KeyValueStore>) -> EnhancedRateLimiter {
        EnhancedRateLimiter::with_clock(kv, SettingsWatcher::from_defaults(), || NOW)
    }

    #[tokio::test]
    async fn allows_within_limit_with_headers() {
        let limiter = limiter(Arc::new(MemoryKv::new()));
        let meta = RequestMeta::for_endpoint("/reviews/42");

        let decision = limiter.check("ip:10.0.0.1", None, &meta).await;
        match decision {
            RateLimitDecision::Allowed {
                limit,
                remaining,
                reset_secs,
            } => {
                // Unauthenticated: 20 + 5 burst.
                assert_eq!(limit, 25);
                assert_eq!(remaining, 24);
                assert_eq!(reset_secs, 60 - (NOW % 60));
            }
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remaining_is_monotone_in_usage() {
        let limiter = limiter(Arc::new(MemoryKv::new()));
        let meta = RequestMeta::for_endpoint("/reviews/42");

        let mut last = u32::MAX;
        for _ in 0..10 {
            match limiter.check("ip:10.0.0.2", None, &meta).await {
                RateLimitDecision::Allowed { remaining, .. } => {
                    assert!(remaining < last);
                    last = remaining;
                }
                other => panic!("unexpected block: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn request_26_blocks_for_thirty_minutes() {
        let limiter = limiter(Arc::new(MemoryKv::new()));
        let meta = RequestMeta::for_endpoint("/reviews/pending-page");

        for i in 0..25 {
            let d = limiter.check("ip:10.0.0.3", None, &meta).await;
            assert!(d.is_allowed(), "request {} unexpectedly blocked", i + 1);
        }

        match limiter.check("ip:10.0.0.3", None, &meta).await {
            RateLimitDecision::Blocked {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 1800),
            other => panic!("expected block, got {other:?}"),
        }

        // While blocked, every further request is refused with the
        // remaining wait.
        match limiter.check("ip:10.0.0.3", None, &meta).await {
            RateLimitDecision::Blocked {
                retry_after_secs, ..
            } => assert!(retry_after_secs <= 1800),
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_violation_doubles_the_penalty() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = limiter(kv.clone());
        let meta = RequestMeta::for_endpoint("/somewhere");

        for _ in 0..26 {
            limiter.check("ip:10.0.0.4", None, &meta).await;
        }
        // Simulate the unblock without losing the violation history.
        kv.del("rate_limit:ip:10.0.0.4:blocked").await.unwrap();

        match limiter.check("ip:10.0.0.4", None, &meta).await {
            RateLimitDecision::Blocked {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 60 * 60, "min(30·2¹, 480) minutes"),
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn penalty_is_capped_at_the_role_maximum() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = limiter(kv.clone());
        let violations_key = "rate_limit:ip:10.0.0.5:violations";
        // Five prior violations: 30 · 2⁵ = 960 > 480 cap.
        for i in 0..5 {
            kv.zadd(violations_key, (NOW - 100 - i) as f64, &format!("v{i}"))
                .await
                .unwrap();
        }

        let meta = RequestMeta::for_endpoint("/somewhere");
        for _ in 0..25 {
            limiter.check("ip:10.0.0.5", None, &meta).await;
        }
        match limiter.check("ip:10.0.0.5", None, &meta).await {
            RateLimitDecision::Blocked {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 480 * 60),
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn roles_and_endpoints_scale_the_budget() {
        let limiter = limiter(Arc::new(MemoryKv::new()));

        // Admin on a neutral endpoint: 120 + 20.
        match limiter
            .check(
                "user:admin1",
                Some(Role::Admin),
                &RequestMeta::for_endpoint("/reviews/1"),
            )
            .await
        {
            RateLimitDecision::Allowed { limit, .. } => assert_eq!(limit, 140),
            other => panic!("{other:?}"),
        }

        // Unauthenticated on /auth/login: (20·0.1=2) + (5·0.1→0) = 2.
        let meta = RequestMeta::for_endpoint("/auth/login");
        assert!(limiter.check("ip:9.9.9.9", None, &meta).await.is_allowed());
        assert!(limiter.check("ip:9.9.9.9", None, &meta).await.is_allowed());
        assert!(!limiter.check("ip:9.9.9.9", None, &meta).await.is_allowed());
    }

    #[tokio::test]
    async fn violations_feed_and_client_stats() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = limiter(kv.clone());
        let meta = RequestMeta {
            endpoint: "/reviews/queue".into(),
            user_agent: Some("test-agent".into()),
            ip: Some("10.0.0.6".into()),
        };

        for _ in 0..26 {
            limiter.check("ip:10.0.0.6", None, &meta).await;
        }

        let stats = limiter.client_stats("ip:10.0.0.6").await.unwrap();
        assert!(stats.blocked);
        assert_eq!(stats.violations_24h.len(), 1);
        assert_eq!(stats.violations_24h[0]["endpoint"], "/reviews/queue");
        assert_eq!(stats.violations_24h[0]["user_agent"], "test-agent");

        let feed = limiter.recent_violations(10).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0]["identity"], "ip:10.0.0.6");

        limiter.clear_violations("ip:10.0.0.6").await.unwrap();
        let stats = limiter.client_stats("ip:10.0.0.6").await.unwrap();
        assert!(!stats.blocked);
        assert!(stats.violations_24h.is_empty());
    }

    #[tokio::test]
    async fn kv_failure_fails_open() {
        struct DownKv;

        #[async_trait::async_trait]
        impl KeyValueStore for DownKv {
            async fn ping(&self) -> gr_stores::error::Result<()> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn get(&self, _: &str) -> gr_stores::error::Result<Option<String>> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn set_ex(
                &self,
                _: &str,
                _: &str,
                _: Duration,
            ) -> gr_stores::error::Result<()> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn del(&self, _: &str) -> gr_stores::error::Result<()> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn expire(&self, _: &str, _: Duration) -> gr_stores::error::Result<()> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn incr_with_expiry(
                &self,
                _: &str,
                _: Duration,
            ) -> gr_stores::error::Result<i64> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn hset(&self, _: &str, _: &str, _: &str) -> gr_stores::error::Result<()> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn hget(&self, _: &str, _: &str) -> gr_stores::error::Result<Option<String>> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn hgetall(&self, _: &str) -> gr_stores::error::Result<Vec<(String, String)>> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn hdel(&self, _: &str, _: &str) -> gr_stores::error::Result<()> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn hlen(&self, _: &str) -> gr_stores::error::Result<usize> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn lpush_capped(
                &self,
                _: &str,
                _: &str,
                _: usize,
            ) -> gr_stores::error::Result<()> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn lrange(
                &self,
                _: &str,
                _: isize,
                _: isize,
            ) -> gr_stores::error::Result<Vec<String>> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn llen(&self, _: &str) -> gr_stores::error::Result<usize> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn zadd(&self, _: &str, _: f64, _: &str) -> gr_stores::error::Result<()> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn zrangebyscore(
                &self,
                _: &str,
                _: f64,
                _: f64,
            ) -> gr_stores::error::Result<Vec<String>> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn zremrangebyscore(
                &self,
                _: &str,
                _: f64,
                _: f64,
            ) -> gr_stores::error::Result<usize> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
            async fn zcount(&self, _: &str, _: f64, _: f64) -> gr_stores::error::Result<usize> {
                Err(gr_stores::StoreError::ConnectionLost("down".into()))
            }
        }

        let limiter = EnhancedRateLimiter::with_clock(
            Arc::new(DownKv),
            SettingsWatcher::from_defaults(),
            || NOW,
        );
        let decision = limiter
            .check("ip:1.2.3.4", None, &RequestMeta::for_endpoint("/x"))
            .await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn provider_traffic_is_throttled_separately() {
        let limiter = limiter(Arc::new(MemoryKv::new()));

        // Provider budget: 60 + 10.
        for i in 0..70 {
            let d = limiter.check_provider("draft").await;
            assert!(d.is_allowed(), "provider call {} blocked early", i + 1);
        }
        assert!(!limiter.check_provider("draft").await.is_allowed());
        // A different provider key is unaffected.
        assert!(limiter.check_provider("refine").await.is_allowed());
    }
}
