use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, loaded from `greenroom.toml` with an environment
/// overlay applied on top (see [`Config::apply_env`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            stores: StoresConfig::default(),
            auth: AuthConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            memory: MemoryConfig::default(),
            pipeline: PipelineConfig::default(),
            protocol: ProtocolConfig::default(),
            rate_limits: RateLimitsConfig::default(),
        }
    }
}

impl Config {
    /// Load from `./greenroom.toml` when present, otherwise defaults.
    /// Environment variables win over the file either way.
    pub fn load() -> Result<Self, ConfigError> {
        let path = PathBuf::from("greenroom.toml");
        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load from a specific path (no env overlay).
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Overlay the deployment environment variables onto the file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.stores.database_url = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.stores.redis_url = v;
        }
        if let Ok(v) = std::env::var("DOCUMENT_STORE_URI") {
            self.stores.document_store_uri = Some(v);
        }
        if let Ok(v) = std::env::var("JWT_SECRET_KEY") {
            self.auth.jwt_secret_key = Some(v);
        }
        if let Ok(v) = std::env::var("JWT_ACCESS_TOKEN_EXPIRE_MINUTES") {
            if let Ok(n) = v.parse() {
                self.auth.access_token_expire_minutes = n;
            }
        }
        if let Ok(v) = std::env::var("JWT_REFRESH_TOKEN_EXPIRE_DAYS") {
            if let Ok(n) = v.parse() {
                self.auth.refresh_token_expire_days = n;
            }
        }
        if let Ok(v) = std::env::var("SESSION_TIMEOUT_MINUTES") {
            if let Ok(n) = v.parse() {
                self.auth.session_timeout_minutes = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_SESSIONS_PER_USER") {
            if let Ok(n) = v.parse() {
                self.auth.max_sessions_per_user = n;
            }
        }
        if let Ok(v) = std::env::var("USE_LOCAL_EMBEDDINGS") {
            self.embeddings.use_local = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("LOCAL_EMBEDDINGS_MODEL") {
            self.embeddings.local_model = v;
        }
        if let Ok(v) = std::env::var("FRONTEND_URL") {
            self.auth.frontend_url = v;
        }
        if let Ok(v) = std::env::var("DASHBOARD_API_KEY") {
            self.auth.dashboard_api_key = Some(v);
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Absent means: no document store; cold memories stay in the warm
    /// store and semantic search returns empty.
    #[serde(default)]
    pub document_store_uri: Option<String>,
    #[serde(default = "default_db_min")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_max")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_op_timeout")]
    pub db_op_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout")]
    pub db_acquire_timeout_secs: u64,
    #[serde(default = "default_kv_op_timeout")]
    pub kv_op_timeout_ms: u64,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            redis_url: default_redis_url(),
            document_store_uri: None,
            db_min_connections: default_db_min(),
            db_max_connections: default_db_max(),
            db_op_timeout_secs: default_db_op_timeout(),
            db_acquire_timeout_secs: default_db_acquire_timeout(),
            kv_op_timeout_ms: default_kv_op_timeout(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/greenroom".into()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_db_min() -> u32 {
    2
}
fn default_db_max() -> u32 {
    10
}
fn default_db_op_timeout() -> u64 {
    30
}
fn default_db_acquire_timeout() -> u64 {
    5
}
fn default_kv_op_timeout() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret_key: Option<String>,
    #[serde(default = "default_access_expire")]
    pub access_token_expire_minutes: u64,
    #[serde(default = "default_refresh_expire")]
    pub refresh_token_expire_days: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_minutes: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: u32,
    /// Legacy static dashboard key; maps to an implicit admin identity.
    #[serde(default)]
    pub dashboard_api_key: Option<String>,
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret_key: None,
            access_token_expire_minutes: default_access_expire(),
            refresh_token_expire_days: default_refresh_expire(),
            session_timeout_minutes: default_session_timeout(),
            max_sessions_per_user: default_max_sessions(),
            dashboard_api_key: None,
            frontend_url: default_frontend_url(),
        }
    }
}

fn default_access_expire() -> u64 {
    30
}
fn default_refresh_expire() -> u64 {
    7
}
fn default_session_timeout() -> u64 {
    60
}
fn default_max_sessions() -> u32 {
    5
}
fn default_frontend_url() -> String {
    "http://localhost:3000".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_use_local")]
    pub use_local: bool,
    #[serde(default = "default_local_model")]
    pub local_model: String,
    #[serde(default)]
    pub remote_api_url: Option<String>,
    #[serde(default = "default_remote_key_env")]
    pub remote_api_key_env: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Document-relevance threshold. The score distributions of the two
    /// backends differ, so each carries its own constant.
    #[serde(default = "default_local_threshold")]
    pub local_similarity_threshold: f64,
    #[serde(default = "default_remote_threshold")]
    pub remote_similarity_threshold: f64,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            use_local: default_use_local(),
            local_model: default_local_model(),
            remote_api_url: None,
            remote_api_key_env: default_remote_key_env(),
            cache_capacity: default_cache_capacity(),
            local_similarity_threshold: default_local_threshold(),
            remote_similarity_threshold: default_remote_threshold(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl EmbeddingsConfig {
    /// The relevance threshold matching the active backend.
    pub fn similarity_threshold(&self) -> f64 {
        if self.use_local {
            self.local_similarity_threshold
        } else {
            self.remote_similarity_threshold
        }
    }
}

fn default_use_local() -> bool {
    true
}
fn default_local_model() -> String {
    "hashed-ngram-384".into()
}
fn default_remote_key_env() -> String {
    "EMBEDDINGS_API_KEY".into()
}
fn default_cache_capacity() -> usize {
    2000
}
fn default_local_threshold() -> f64 {
    0.05
}
fn default_remote_threshold() -> f64 {
    0.6
}
fn default_max_input_chars() -> usize {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_hot_days")]
    pub hot_tier_days: i64,
    #[serde(default = "default_warm_days")]
    pub warm_tier_days: i64,
    #[serde(default = "default_cold_days")]
    pub cold_tier_days: i64,
    #[serde(default = "default_hot_ttl")]
    pub hot_ttl_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            hot_tier_days: default_hot_days(),
            warm_tier_days: default_warm_days(),
            cold_tier_days: default_cold_days(),
            hot_ttl_secs: default_hot_ttl(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_hot_days() -> i64 {
    7
}
fn default_warm_days() -> i64 {
    30
}
fn default_cold_days() -> i64 {
    90
}
fn default_hot_ttl() -> u64 {
    7 * 24 * 3600
}
fn default_retention_days() -> i64 {
    365
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 0 means one worker per CPU core.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
    #[serde(default = "default_bubble_delay_ms")]
    pub bubble_delay_ms: u64,
    #[serde(default = "default_message_deadline")]
    pub message_deadline_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_stale_review_minutes")]
    pub stale_review_minutes: i64,
    #[serde(default = "default_redelivery_after")]
    pub redelivery_after_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            debounce_ms: default_debounce_ms(),
            lane_capacity: default_lane_capacity(),
            bubble_delay_ms: default_bubble_delay_ms(),
            message_deadline_secs: default_message_deadline(),
            shutdown_grace_secs: default_shutdown_grace(),
            stale_review_minutes: default_stale_review_minutes(),
            redelivery_after_secs: default_redelivery_after(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    2000
}
fn default_lane_capacity() -> usize {
    100
}
fn default_bubble_delay_ms() -> u64 {
    500
}
fn default_message_deadline() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_stale_review_minutes() -> i64 {
    30
}
fn default_redelivery_after() -> i64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Estimated generation cost avoided per quarantined message.
    #[serde(default = "default_cost_per_message")]
    pub cost_per_message: f64,
    #[serde(default = "default_quarantine_ttl_days")]
    pub quarantine_ttl_days: i64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Divert decisions tolerate state this stale, no more.
    #[serde(default = "default_state_cache_secs")]
    pub state_cache_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            cost_per_message: default_cost_per_message(),
            quarantine_ttl_days: default_quarantine_ttl_days(),
            cleanup_interval_secs: default_cleanup_interval(),
            state_cache_secs: default_state_cache_secs(),
        }
    }
}

fn default_cost_per_message() -> f64 {
    0.000307
}
fn default_quarantine_ttl_days() -> i64 {
    7
}
fn default_cleanup_interval() -> u64 {
    3600
}
fn default_state_cache_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Path of the role/endpoint limits file (hot-reloaded on mtime change).
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            monitor_interval_secs: default_monitor_interval(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = Config::default();
        assert_eq!(cfg.stores.db_min_connections, 2);
        assert_eq!(cfg.stores.db_max_connections, 10);
        assert_eq!(cfg.stores.db_op_timeout_secs, 30);
        assert_eq!(cfg.pipeline.debounce_ms, 2000);
        assert_eq!(cfg.pipeline.lane_capacity, 100);
        assert_eq!(cfg.pipeline.bubble_delay_ms, 500);
        assert!((cfg.protocol.cost_per_message - 0.000307).abs() < 1e-9);
        assert_eq!(cfg.memory.hot_tier_days, 7);
        assert_eq!(cfg.memory.warm_tier_days, 30);
        assert_eq!(cfg.memory.cold_tier_days, 90);
    }

    #[test]
    fn threshold_follows_backend() {
        let mut e = EmbeddingsConfig::default();
        e.use_local = true;
        assert!((e.similarity_threshold() - 0.05).abs() < 1e-9);
        e.use_local = false;
        assert!((e.similarity_threshold() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn load_from_partial_file_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[server]\nport = 9100\n\n[pipeline]\ndebounce_ms = 500\n"
        )
        .unwrap();

        let cfg = Config::load_from(f.path()).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.pipeline.debounce_ms, 500);
        // Untouched sections keep defaults.
        assert_eq!(cfg.stores.db_max_connections, 10);
    }

    #[test]
    fn load_from_missing_file_errors() {
        assert!(Config::load_from("/nonexistent/greenroom.toml").is_err());
    }
}
