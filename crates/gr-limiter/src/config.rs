use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use gr_core::types::Role;

// ---------------------------------------------------------------------------
// RoleLimit
// ---------------------------------------------------------------------------

/// Per-role limit parameters. Progressive backoff doubles the penalty with
/// each prior violation in a 24-hour window, capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleLimit {
    pub requests_per_minute: u32,
    pub burst_allowance: u32,
    #[serde(default = "default_progressive")]
    pub progressive_backoff: bool,
    pub violation_penalty_minutes: u32,
    pub max_penalty_minutes: u32,
}

fn default_progressive() -> bool {
    true
}

impl RoleLimit {
    fn admin() -> Self {
        Self {
            requests_per_minute: 120,
            burst_allowance: 20,
            progressive_backoff: true,
            violation_penalty_minutes: 5,
            max_penalty_minutes: 60,
        }
    }

    fn reviewer() -> Self {
        Self {
            requests_per_minute: 60,
            burst_allowance: 15,
            progressive_backoff: true,
            violation_penalty_minutes: 10,
            max_penalty_minutes: 120,
        }
    }

    fn viewer() -> Self {
        Self {
            requests_per_minute: 30,
            burst_allowance: 10,
            progressive_backoff: true,
            violation_penalty_minutes: 15,
            max_penalty_minutes: 240,
        }
    }

    fn unauthenticated() -> Self {
        Self {
            requests_per_minute: 20,
            burst_allowance: 5,
            progressive_backoff: true,
            violation_penalty_minutes: 30,
            max_penalty_minutes: 480,
        }
    }

    fn provider() -> Self {
        Self {
            requests_per_minute: 60,
            burst_allowance: 10,
            progressive_backoff: false,
            violation_penalty_minutes: 1,
            max_penalty_minutes: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// LimiterSettings
// ---------------------------------------------------------------------------

/// The full limiter configuration: role tables, endpoint modifiers, and the
/// outbound-provider limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "RoleLimit::admin")]
    pub admin: RoleLimit,
    #[serde(default = "RoleLimit::reviewer")]
    pub reviewer: RoleLimit,
    #[serde(default = "RoleLimit::viewer")]
    pub viewer: RoleLimit,
    #[serde(default = "RoleLimit::unauthenticated")]
    pub unauthenticated: RoleLimit,
    /// Limits applied to outbound AI-provider traffic.
    #[serde(default = "RoleLimit::provider")]
    pub provider: RoleLimit,
    /// Endpoint pattern → multiplier on req/min and burst. Exact match wins
    /// over a `*` wildcard prefix match.
    #[serde(default = "default_endpoint_modifiers")]
    pub endpoint_modifiers: BTreeMap<String, f64>,
}

fn default_endpoint_modifiers() -> BTreeMap<String, f64> {
    BTreeMap::from([
        // Authentication endpoints: tight.
        ("/auth/login".to_string(), 0.1),
        ("/auth/refresh".to_string(), 0.2),
        ("/auth/callback".to_string(), 0.3),
        // Review queue polling: generous.
        ("/reviews/pending".to_string(), 2.0),
        ("/reviews/*/approve".to_string(), 0.5),
        ("/reviews/*/reject".to_string(), 0.5),
        // Health probes: near-free.
        ("/health".to_string(), 5.0),
        ("/mcp/health".to_string(), 3.0),
        // Admin maintenance: tight.
        ("/quarantine/batch-process".to_string(), 0.2),
        ("/quarantine/cleanup".to_string(), 0.1),
        ("/api/rate-limits/*".to_string(), 1.0),
    ])
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            admin: RoleLimit::admin(),
            reviewer: RoleLimit::reviewer(),
            viewer: RoleLimit::viewer(),
            unauthenticated: RoleLimit::unauthenticated(),
            provider: RoleLimit::provider(),
            endpoint_modifiers: default_endpoint_modifiers(),
        }
    }
}

impl LimiterSettings {
    pub fn for_role(&self, role: Option<Role>) -> &RoleLimit {
        match role {
            Some(Role::Admin) => &self.admin,
            Some(Role::Reviewer) => &self.reviewer,
            Some(Role::Viewer) => &self.viewer,
            None => &self.unauthenticated,
        }
    }

    /// Multiplier for an endpoint. Exact match first, then wildcard
    /// patterns matched on their prefix before the `*`.
    pub fn endpoint_modifier(&self, endpoint: &str) -> f64 {
        if let Some(m) = self.endpoint_modifiers.get(endpoint) {
            return *m;
        }
        for (pattern, modifier) in &self.endpoint_modifiers {
            if let Some(prefix) = pattern.split('*').next() {
                if pattern.contains('*') && endpoint.starts_with(prefix) {
                    return *modifier;
                }
            }
        }
        1.0
    }

    /// The limit actually enforced for (role, endpoint): req/min floors at
    /// 1, burst at 0.
    pub fn effective(&self, role: Option<Role>, endpoint: &str) -> RoleLimit {
        let base = self.for_role(role);
        let modifier = self.endpoint_modifier(endpoint);
        RoleLimit {
            requests_per_minute: ((base.requests_per_minute as f64 * modifier) as u32).max(1),
            burst_allowance: (base.burst_allowance as f64 * modifier) as u32,
            progressive_backoff: base.progressive_backoff,
            violation_penalty_minutes: base.violation_penalty_minutes,
            max_penalty_minutes: base.max_penalty_minutes,
        }
    }
}

// ---------------------------------------------------------------------------
// SettingsWatcher
// ---------------------------------------------------------------------------

/// Read-mostly snapshot of [`LimiterSettings`], reloaded from a TOML file
/// only when its mtime changes. Without a file, defaults apply forever.
pub struct SettingsWatcher {
    path: Option<PathBuf>,
    last_mtime: Mutex<Option<SystemTime>>,
    snapshot: RwLock<Arc<LimiterSettings>>,
}

impl SettingsWatcher {
    pub fn from_defaults() -> Self {
        Self {
            path: None,
            last_mtime: Mutex::new(None),
            snapshot: RwLock::new(Arc::new(LimiterSettings::default())),
        }
    }

    pub fn watching(path: impl Into<PathBuf>) -> Self {
        let watcher = Self {
            path: Some(path.into()),
            last_mtime: Mutex::new(None),
            snapshot: RwLock::new(Arc::new(LimiterSettings::default())),
        };
        watcher.reload_if_changed();
        watcher
    }

    /// Current settings, reloading first when the backing file changed.
    pub fn current(&self) -> Arc<LimiterSettings> {
        self.reload_if_changed();
        self.snapshot.read().expect("limiter settings lock").clone()
    }

    fn reload_if_changed(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let Ok(meta) = std::fs::metadata(path) else {
            return;
        };
        let Ok(mtime) = meta.modified() else {
            return;
        };

        {
            let last = self.last_mtime.lock().expect("mtime lock");
            if *last == Some(mtime) {
                return;
            }
        }

        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<LimiterSettings>(&text) {
                Ok(settings) => {
                    *self.snapshot.write().expect("limiter settings lock") = Arc::new(settings);
                    *self.last_mtime.lock().expect("mtime lock") = Some(mtime);
                    info!(path = %path.display(), "rate limit configuration reloaded");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid rate limit config, keeping previous");
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable rate limit config, keeping previous");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn role_defaults_match_the_published_table() {
        let s = LimiterSettings::default();
        assert_eq!(s.admin.requests_per_minute, 120);
        assert_eq!(s.admin.burst_allowance, 20);
        assert_eq!(s.reviewer.requests_per_minute, 60);
        assert_eq!(s.viewer.violation_penalty_minutes, 15);
        assert_eq!(s.unauthenticated.requests_per_minute, 20);
        assert_eq!(s.unauthenticated.burst_allowance, 5);
        assert_eq!(s.unauthenticated.violation_penalty_minutes, 30);
        assert_eq!(s.unauthenticated.max_penalty_minutes, 480);
    }

    #[test]
    fn exact_modifier_beats_wildcard() {
        let s = LimiterSettings::default();
        assert!((s.endpoint_modifier("/reviews/pending") - 2.0).abs() < 1e-9);
        assert!((s.endpoint_modifier("/reviews/42/approve") - 0.5).abs() < 1e-9);
        assert!((s.endpoint_modifier("/api/rate-limits/stats") - 1.0).abs() < 1e-9);
        assert!((s.endpoint_modifier("/unknown/route") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn effective_limits_floor_correctly() {
        let s = LimiterSettings::default();
        // /auth/login at 0.1 for unauthenticated: 20 * 0.1 = 2, burst 0.5 → 0.
        let e = s.effective(None, "/auth/login");
        assert_eq!(e.requests_per_minute, 2);
        assert_eq!(e.burst_allowance, 0);

        // A tiny base never drops below one request per minute.
        let mut tiny = LimiterSettings::default();
        tiny.unauthenticated.requests_per_minute = 1;
        let e = tiny.effective(None, "/auth/login");
        assert_eq!(e.requests_per_minute, 1);
    }

    #[test]
    fn role_resolution() {
        let s = LimiterSettings::default();
        assert_eq!(s.for_role(Some(Role::Admin)).requests_per_minute, 120);
        assert_eq!(s.for_role(Some(Role::Reviewer)).requests_per_minute, 60);
        assert_eq!(s.for_role(Some(Role::Viewer)).requests_per_minute, 30);
        assert_eq!(s.for_role(None).requests_per_minute, 20);
    }

    #[test]
    fn watcher_reloads_on_mtime_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[unauthenticated]\nrequests_per_minute = 7\nburst_allowance = 1\n\
             violation_penalty_minutes = 5\nmax_penalty_minutes = 10"
        )
        .unwrap();
        file.flush().unwrap();

        let watcher = SettingsWatcher::watching(file.path());
        assert_eq!(watcher.current().unauthenticated.requests_per_minute, 7);
        // Untouched roles fall back to defaults.
        assert_eq!(watcher.current().admin.requests_per_minute, 120);

        // Rewrite with a new mtime.
        std::fs::write(
            file.path(),
            "[unauthenticated]\nrequests_per_minute = 9\nburst_allowance = 1\n\
             violation_penalty_minutes = 5\nmax_penalty_minutes = 10",
        )
        .unwrap();
        let new_mtime = SystemTime::now() + std::time::Duration::from_secs(2);
        let _ = filetime_set(file.path(), new_mtime);

        assert_eq!(watcher.current().unauthenticated.requests_per_minute, 9);
    }

    // Push a file's mtime forward without an external crate.
    fn filetime_set(path: &std::path::Path, to: SystemTime) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        file.set_modified(to)?;
        Ok(())
    }

    #[test]
    fn invalid_reload_keeps_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[viewer]\nrequests_per_minute = 3\nburst_allowance = 0\n\
             violation_penalty_minutes = 1\nmax_penalty_minutes = 2"
        )
        .unwrap();
        file.flush().unwrap();

        let watcher = SettingsWatcher::watching(file.path());
        assert_eq!(watcher.current().viewer.requests_per_minute, 3);

        std::fs::write(file.path(), "this is not toml = = =").unwrap();
        let _ = filetime_set(file.path(), SystemTime::now() + std::time::Duration::from_secs(2));

        assert_eq!(watcher.current().viewer.requests_per_minute, 3);
    }
}
