use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use gr_core::config::StoresConfig;

/// Maximum attempts for deadlock / connection-loss retries.
const MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Warm-tier client: a bounded PostgreSQL pool with failure classification
/// and bounded retries for the retryable classes.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect with the configured pool bounds. Pool acquisition waits at
    /// most `db_acquire_timeout_secs` before surfacing a timeout; each
    /// session gets a server-side statement timeout.
    pub async fn connect(cfg: &StoresConfig) -> Result<Self> {
        let statement_timeout = format!("SET statement_timeout = '{}s'", cfg.db_op_timeout_secs);
        let pool = PgPoolOptions::new()
            .min_connections(cfg.db_min_connections)
            .max_connections(cfg.db_max_connections)
            .acquire_timeout(Duration::from_secs(cfg.db_acquire_timeout_secs))
            .after_connect(move |conn, _meta| {
                let stmt = statement_timeout.clone();
                Box::pin(async move {
                    sqlx::Executor::execute(conn, stmt.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&cfg.database_url)
            .await
            .map_err(StoreError::from)?;

        debug!(
            min = cfg.db_min_connections,
            max = cfg.db_max_connections,
            "relational store connected"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Run `f`, retrying deadlocks and connection losses up to
    /// [`MAX_RETRIES`] times with exponential backoff. Constraint
    /// violations and timeouts surface immediately.
    pub async fn with_retries<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = retry_delay(attempt);
                    warn!(op, attempt, error = %e, "retrying relational operation");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create every table and index the system persists to. Idempotent.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_DDL)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        debug!("relational schema ensured");
        Ok(())
    }
}

/// Exponential backoff: 100ms, 200ms, 400ms.
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 * 2u64.pow(attempt.saturating_sub(1)))
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    display_name  TEXT,
    role          TEXT NOT NULL DEFAULT 'viewer',
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS user_sessions (
    id          UUID PRIMARY KEY,
    user_id     TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at  TIMESTAMPTZ NOT NULL,
    revoked_at  TIMESTAMPTZ,
    user_agent  TEXT,
    ip_address  TEXT
);
CREATE INDEX IF NOT EXISTS idx_user_sessions_user ON user_sessions(user_id);

CREATE TABLE IF NOT EXISTS interactions (
    id                  UUID PRIMARY KEY,
    user_id             TEXT NOT NULL,
    user_message        TEXT NOT NULL,
    raw_generation      TEXT NOT NULL DEFAULT '',
    refined_bubbles     JSONB NOT NULL DEFAULT '[]',
    risk_score          DOUBLE PRECISION NOT NULL DEFAULT 0,
    risk_flags          JSONB NOT NULL DEFAULT '[]',
    risk_recommendation TEXT NOT NULL DEFAULT 'review',
    priority_score      DOUBLE PRECISION NOT NULL DEFAULT 0,
    review_status       TEXT NOT NULL DEFAULT 'pending',
    reviewer_id         TEXT,
    edit_tags           JSONB NOT NULL DEFAULT '[]',
    final_bubbles       JSONB,
    quality_score       SMALLINT,
    reviewer_notes      TEXT,
    delivery_hold       BOOLEAN NOT NULL DEFAULT FALSE,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    review_started_at   TIMESTAMPTZ,
    decided_at          TIMESTAMPTZ,
    delivered_at        TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_interactions_user   ON interactions(user_id);
CREATE INDEX IF NOT EXISTS idx_interactions_status ON interactions(review_status);
CREATE INDEX IF NOT EXISTS idx_interactions_queue
    ON interactions(priority_score DESC, created_at ASC)
    WHERE review_status = 'pending';
CREATE UNIQUE INDEX IF NOT EXISTS idx_interactions_one_in_review
    ON interactions(user_id)
    WHERE review_status = 'in_review';

CREATE TABLE IF NOT EXISTS human_edits (
    id             BIGSERIAL PRIMARY KEY,
    interaction_id UUID NOT NULL,
    reviewer_id    TEXT NOT NULL,
    edit_tags      JSONB NOT NULL DEFAULT '[]',
    quality_score  SMALLINT,
    notes          TEXT,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_human_edits_interaction ON human_edits(interaction_id);

CREATE TABLE IF NOT EXISTS user_protocol_status (
    user_id              TEXT PRIMARY KEY,
    status               TEXT NOT NULL DEFAULT 'INACTIVE',
    activated_by         TEXT,
    activated_at         TIMESTAMPTZ,
    reason               TEXT,
    messages_quarantined BIGINT NOT NULL DEFAULT 0,
    cost_saved           DOUBLE PRECISION NOT NULL DEFAULT 0,
    last_message_at      TIMESTAMPTZ,
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS quarantine_messages (
    id                  UUID PRIMARY KEY,
    user_id             TEXT NOT NULL,
    message_text        TEXT NOT NULL,
    external_message_id TEXT,
    received_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at          TIMESTAMPTZ NOT NULL,
    processed           BOOLEAN NOT NULL DEFAULT FALSE,
    processed_at        TIMESTAMPTZ,
    processed_by        TEXT
);
CREATE INDEX IF NOT EXISTS idx_quarantine_user    ON quarantine_messages(user_id);
CREATE INDEX IF NOT EXISTS idx_quarantine_expires ON quarantine_messages(expires_at)
    WHERE processed = FALSE;

CREATE TABLE IF NOT EXISTS protocol_audit_log (
    id              BIGSERIAL PRIMARY KEY,
    user_id         TEXT NOT NULL,
    action          TEXT NOT NULL,
    performed_by    TEXT NOT NULL,
    reason          TEXT,
    previous_status TEXT NOT NULL,
    new_status      TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_protocol_audit_user ON protocol_audit_log(user_id, created_at);

CREATE TABLE IF NOT EXISTS agent_config (
    agent_type            TEXT PRIMARY KEY,
    memory_strategy       TEXT NOT NULL DEFAULT 'hybrid',
    context_window_tokens INTEGER NOT NULL DEFAULT 8000,
    compression_threshold DOUBLE PRECISION NOT NULL DEFAULT 0.75,
    retrieval_k           INTEGER NOT NULL DEFAULT 5,
    temperature           DOUBLE PRECISION NOT NULL DEFAULT 0.7,
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS prompt_library (
    prompt_id  TEXT PRIMARY KEY,
    template   TEXT NOT NULL,
    active     BOOLEAN NOT NULL DEFAULT TRUE,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS memory_interaction_metadata (
    memory_id       TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    content         TEXT NOT NULL,
    ts              TIMESTAMPTZ NOT NULL,
    memory_type     TEXT NOT NULL,
    importance      DOUBLE PRECISION NOT NULL,
    tier            TEXT NOT NULL,
    metadata        JSONB NOT NULL DEFAULT '{}',
    retrieval_count INTEGER NOT NULL DEFAULT 0,
    last_retrieved  TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_memory_meta_user ON memory_interaction_metadata(user_id);

CREATE TABLE IF NOT EXISTS memory_user_profiles (
    user_id                   TEXT PRIMARY KEY,
    last_interaction          TIMESTAMPTZ,
    total_interactions        BIGINT NOT NULL DEFAULT 0,
    memory_tier               TEXT,
    last_memory_consolidation TIMESTAMPTZ,
    updated_at                TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS auth_audit_log (
    id         BIGSERIAL PRIMARY KEY,
    user_id    TEXT,
    event      TEXT NOT NULL,
    detail     TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles() {
        assert_eq!(retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(200));
        assert_eq!(retry_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn schema_covers_every_persisted_table() {
        for table in [
            "users",
            "user_sessions",
            "interactions",
            "human_edits",
            "user_protocol_status",
            "quarantine_messages",
            "protocol_audit_log",
            "agent_config",
            "prompt_library",
            "memory_interaction_metadata",
            "memory_user_profiles",
            "auth_audit_log",
        ] {
            assert!(
                SCHEMA_DDL.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn in_review_guard_is_a_partial_unique_index() {
        assert!(SCHEMA_DDL.contains("idx_interactions_one_in_review"));
        assert!(SCHEMA_DDL.contains("WHERE review_status = 'in_review'"));
    }
}
