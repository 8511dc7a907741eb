use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{error, warn};

use crate::limiter::VIOLATION_FEED_KEY;
use gr_stores::KeyValueStore;

/// Capped KV list the alert history lives in.
const ALERTS_KEY: &str = "health_alerts";
const ALERTS_CAP: usize = 100;

// Windowed thresholds.
const SPIKE_WINDOW_SECS: u64 = 5 * 60;
const SPIKE_THRESHOLD: usize = 10;
const ATTACK_WINDOW_SECS: u64 = 15 * 60;
const ATTACK_THRESHOLD: usize = 50;
const BLOCK_RATE_WINDOW_MINUTES: u64 = 10;
const BLOCK_RATE_THRESHOLD: f64 = 0.20;
/// Below this much traffic the block-rate signal is noise.
const BLOCK_RATE_MIN_REQUESTS: u64 = 20;

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// RateLimitMonitor
// ---------------------------------------------------------------------------

type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

/// Background evaluator of windowed abuse signals over the limiter's
/// violation feed and per-minute request/block counters.
///
/// Alert emission writes straight to the KV store and the log. Nothing in
/// here routes through the limiter itself, so monitoring can never be rate
/// limited away.
pub struct RateLimitMonitor {
    kv: Arc<dyn KeyValueStore>,
    clock: Clock,
}

fn wall_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RateLimitMonitor {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            clock: Box::new(wall_clock),
        }
    }

    pub fn with_clock(
        kv: Arc<dyn KeyValueStore>,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            kv,
            clock: Box::new(clock),
        }
    }

    /// One evaluation pass: compute every threshold and persist any alerts.
    pub async fn evaluate(&self) -> Vec<Alert> {
        let now = (self.clock)();
        let mut alerts = Vec::new();

        match self.kv.lrange(VIOLATION_FEED_KEY, 0, -1).await {
            Ok(raw) => {
                let entries: Vec<serde_json::Value> = raw
                    .iter()
                    .filter_map(|v| serde_json::from_str(v).ok())
                    .collect();

                let in_window = |entry: &serde_json::Value, window: u64| {
                    entry["timestamp"]
                        .as_u64()
                        .is_some_and(|ts| ts + window >= now)
                };

                // Violation spike across all identities.
                let recent = entries
                    .iter()
                    .filter(|e| in_window(e, SPIKE_WINDOW_SECS))
                    .count();
                if recent >= SPIKE_THRESHOLD {
                    alerts.push(Alert {
                        severity: AlertSeverity::Warning,
                        kind: "violation_spike".into(),
                        message: format!(
                            "{recent} rate-limit violations in the last 5 minutes"
                        ),
                        value: recent as f64,
                        threshold: SPIKE_THRESHOLD as f64,
                        created_at: now,
                    });
                }

                // Concentrated traffic against one endpoint.
                let mut per_endpoint: HashMap<&str, usize> = HashMap::new();
                for entry in entries.iter().filter(|e| in_window(e, ATTACK_WINDOW_SECS)) {
                    if let Some(endpoint) = entry["endpoint"].as_str() {
                        *per_endpoint.entry(endpoint).or_default() += 1;
                    }
                }
                if let Some((endpoint, count)) =
                    per_endpoint.into_iter().max_by_key(|(_, c)| *c)
                {
                    if count >= ATTACK_THRESHOLD {
                        alerts.push(Alert {
                            severity: AlertSeverity::Critical,
                            kind: "endpoint_attack".into(),
                            message: format!(
                                "{count} violations against {endpoint} in 15 minutes"
                            ),
                            value: count as f64,
                            threshold: ATTACK_THRESHOLD as f64,
                            created_at: now,
                        });
                    }
                }
            }
            Err(e) => error!(error = %e, "alert monitor could not read violation feed"),
        }

        // Sustained share of blocked requests.
        let (requests, blocked) = self.window_counts(now).await;
        if requests >= BLOCK_RATE_MIN_REQUESTS {
            let rate = blocked as f64 / requests as f64;
            if rate >= BLOCK_RATE_THRESHOLD {
                alerts.push(Alert {
                    severity: AlertSeverity::Warning,
                    kind: "sustained_block_rate".into(),
                    message: format!(
                        "{:.0}% of requests blocked over the last 10 minutes",
                        rate * 100.0
                    ),
                    value: rate,
                    threshold: BLOCK_RATE_THRESHOLD,
                    created_at: now,
                });
            }
        }

        for alert in &alerts {
            match alert.severity {
                AlertSeverity::Critical => {
                    error!(kind = %alert.kind, message = %alert.message, "rate limit alert")
                }
                _ => warn!(kind = %alert.kind, message = %alert.message, "rate limit alert"),
            }
            if let Ok(payload) = serde_json::to_string(alert) {
                if let Err(e) = self.kv.lpush_capped(ALERTS_KEY, &payload, ALERTS_CAP).await {
                    error!(error = %e, "could not persist rate limit alert");
                }
            }
        }

        alerts
    }

    async fn window_counts(&self, now: u64) -> (u64, u64) {
        let mut requests = 0u64;
        let mut blocked = 0u64;
        for offset in 0..BLOCK_RATE_WINDOW_MINUTES {
            let minute = now / 60 - offset;
            if let Ok(Some(v)) = self
                .kv
                .get(&format!("rate_limit:stats:requests:{minute}"))
                .await
            {
                requests += v.parse::<u64>().unwrap_or(0);
            }
            if let Ok(Some(v)) = self
                .kv
                .get(&format!("rate_limit:stats:blocked:{minute}"))
                .await
            {
                blocked += v.parse::<u64>().unwrap_or(0);
            }
        }
        (requests, blocked)
    }

    /// Recent alert history, newest first.
    pub async fn recent_alerts(&self, limit: usize) -> Vec<serde_json::Value> {
        match self
            .kv
            .lrange(ALERTS_KEY, 0, limit.saturating_sub(1) as isize)
            .await
        {
            Ok(raw) => raw
                .iter()
                .filter_map(|v| serde_json::from_str(v).ok())
                .collect(),
            Err(e) => {
                error!(error = %e, "could not read alert history");
                Vec::new()
            }
        }
    }

    /// Spawn the periodic evaluation loop. Failures are logged and the next
    /// tick proceeds.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _ = self.evaluate().await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
