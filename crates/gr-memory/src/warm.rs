use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::Row;

use gr_core::types::{MemoryItem, MemoryTier, MemoryType};
use gr_stores::error::{Result, StoreError};
use gr_stores::Database;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Per-user memory profile row, touched on every write and stamped by
/// consolidation.
#[derive(Debug, Clone)]
pub struct UserMemoryProfile {
    pub user_id: String,
    pub last_interaction: Option<DateTime<Utc>>,
    pub total_interactions: i64,
    pub memory_tier: Option<String>,
    pub last_memory_consolidation: Option<DateTime<Utc>>,
}

/// Per-agent tuning knobs loaded from `agent_config`, with the documented
/// defaults when no row exists.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub memory_strategy: String,
    pub context_window_tokens: i32,
    pub compression_threshold: f64,
    pub retrieval_k: i32,
    pub temperature: f64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            memory_strategy: "hybrid".into(),
            context_window_tokens: 8000,
            compression_threshold: 0.75,
            retrieval_k: 5,
            temperature: 0.7,
        }
    }
}

// ---------------------------------------------------------------------------
// WarmMemoryStore trait
// ---------------------------------------------------------------------------

/// Warm-tier persistence for memory items, user profiles, agent config and
/// prompt templates.
#[async_trait]
pub trait WarmMemoryStore: Send + Sync {
    async fn upsert(&self, item: &MemoryItem) -> Result<()>;
    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryItem>>;
    async fn delete(&self, memory_id: &str) -> Result<()>;
    async fn record_retrieval(&self, memory_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn touch_profile(&self, user_id: &str, at: DateTime<Utc>, tier: MemoryTier) -> Result<()>;
    async fn stamp_consolidation(&self, user_id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserMemoryProfile>>;
    /// Users with activity since `since`; drives scheduled consolidation.
    async fn recent_user_ids(&self, since: DateTime<Utc>) -> Result<Vec<String>>;

    async fn agent_settings(&self, agent_type: &str) -> Result<Option<AgentSettings>>;
    async fn prompt_template(&self, prompt_id: &str) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// PgWarmStore
// ---------------------------------------------------------------------------

/// PostgreSQL-backed warm store over `memory_interaction_metadata`,
/// `memory_user_profiles`, `agent_config`, and `prompt_library`.
pub struct PgWarmStore {
    db: Database,
}

impl PgWarmStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_item(row: &sqlx::postgres::PgRow) -> Result<MemoryItem> {
        let memory_type: String = row.try_get("memory_type").map_err(StoreError::from)?;
        let tier: String = row.try_get("tier").map_err(StoreError::from)?;
        let metadata: serde_json::Value = row.try_get("metadata").map_err(StoreError::from)?;

        Ok(MemoryItem {
            user_id: row.try_get("user_id").map_err(StoreError::from)?,
            content: row.try_get("content").map_err(StoreError::from)?,
            timestamp: row.try_get("ts").map_err(StoreError::from)?,
            memory_type: parse_memory_type(&memory_type),
            importance: row.try_get("importance").map_err(StoreError::from)?,
            tier: parse_tier(&tier),
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
            embedding: None,
            retrieval_count: row
                .try_get::<i32, _>("retrieval_count")
                .map_err(StoreError::from)? as u32,
            last_retrieved: row.try_get("last_retrieved").map_err(StoreError::from)?,
        })
    }
}

fn parse_memory_type(s: &str) -> MemoryType {
    match s {
        "preference" => MemoryType::Preference,
        "emotional" => MemoryType::Emotional,
        "factual" => MemoryType::Factual,
        "test" => MemoryType::Test,
        _ => MemoryType::Conversation,
    }
}

fn parse_tier(s: &str) -> MemoryTier {
    match s {
        "hot" => MemoryTier::Hot,
        "cold" => MemoryTier::Cold,
        "archived" => MemoryTier::Archived,
        _ => MemoryTier::Warm,
    }
}

#[async_trait]
impl WarmMemoryStore for PgWarmStore {
    async fn upsert(&self, item: &MemoryItem) -> Result<()> {
        let metadata = serde_json::to_value(&item.metadata)
            .map_err(|e| StoreError::Failure(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO memory_interaction_metadata
                   (memory_id, user_id, content, ts, memory_type, importance,
                    tier, metadata, retrieval_count, last_retrieved)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (memory_id) DO UPDATE SET
                   content = EXCLUDED.content,
                   memory_type = EXCLUDED.memory_type,
                   importance = EXCLUDED.importance,
                   tier = EXCLUDED.tier,
                   metadata = EXCLUDED.metadata,
                   retrieval_count = EXCLUDED.retrieval_count,
                   last_retrieved = EXCLUDED.last_retrieved"#,
        )
        .bind(item.memory_id())
        .bind(&item.user_id)
        .bind(&item.content)
        .bind(item.timestamp)
        .bind(item.memory_type.as_str())
        .bind(item.importance)
        .bind(item.tier.as_str())
        .bind(metadata)
        .bind(item.retrieval_count as i32)
        .bind(item.last_retrieved)
        .execute(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryItem>> {
        let rows = sqlx::query(
            r#"SELECT user_id, content, ts, memory_type, importance, tier,
                      metadata, retrieval_count, last_retrieved
               FROM memory_interaction_metadata
               WHERE user_id = $1
               ORDER BY ts DESC
               LIMIT $2"#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(StoreError::from)?;

        rows.iter().map(Self::row_to_item).collect()
    }

    async fn delete(&self, memory_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM memory_interaction_metadata WHERE memory_id = $1")
            .bind(memory_id)
            .execute(self.db.pool())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn record_retrieval(&self, memory_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"UPDATE memory_interaction_metadata
               SET retrieval_count = retrieval_count + 1, last_retrieved = $2
               WHERE memory_id = $1"#,
        )
        .bind(memory_id)
        .bind(at)
        .execute(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn touch_profile(&self, user_id: &str, at: DateTime<Utc>, tier: MemoryTier) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO memory_user_profiles
                   (user_id, last_interaction, total_interactions, memory_tier, updated_at)
               VALUES ($1, $2, 1, $3, NOW())
               ON CONFLICT (user_id) DO UPDATE SET
                   last_interaction = EXCLUDED.last_interaction,
                   total_interactions = memory_user_profiles.total_interactions + 1,
                   memory_tier = EXCLUDED.memory_tier,
                   updated_at = NOW()"#,
        )
        .bind(user_id)
        .bind(at)
        .bind(tier.as_str())
        .execute(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn stamp_consolidation(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"UPDATE memory_user_profiles
               SET last_memory_consolidation = $2, updated_at = NOW()
               WHERE user_id = $1"#,
        )
        .bind(user_id)
        .bind(at)
        .execute(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserMemoryProfile>> {
        let row = sqlx::query(
            r#"SELECT user_id, last_interaction, total_interactions,
                      memory_tier, last_memory_consolidation
               FROM memory_user_profiles WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(match row {
            Some(row) => Some(UserMemoryProfile {
                user_id: row.try_get("user_id").map_err(StoreError::from)?,
                last_interaction: row.try_get("last_interaction").map_err(StoreError::from)?,
                total_interactions: row
                    .try_get("total_interactions")
                    .map_err(StoreError::from)?,
                memory_tier: row.try_get("memory_tier").map_err(StoreError::from)?,
                last_memory_consolidation: row
                    .try_get("last_memory_consolidation")
                    .map_err(StoreError::from)?,
            }),
            None => None,
        })
    }

    async fn recent_user_ids(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT user_id FROM memory_user_profiles WHERE last_interaction >= $1",
        )
        .bind(since)
        .fetch_all(self.db.pool())
        .await
        .map_err(StoreError::from)?;

        rows.iter()
            .map(|r| r.try_get("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn agent_settings(&self, agent_type: &str) -> Result<Option<AgentSettings>> {
        let row = sqlx::query(
            r#"SELECT memory_strategy, context_window_tokens, compression_threshold,
                      retrieval_k, temperature
               FROM agent_config WHERE agent_type = $1"#,
        )
        .bind(agent_type)
        .fetch_optional(self.db.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(match row {
            Some(row) => Some(AgentSettings {
                memory_strategy: row.try_get("memory_strategy").map_err(StoreError::from)?,
                context_window_tokens: row
                    .try_get("context_window_tokens")
                    .map_err(StoreError::from)?,
                compression_threshold: row
                    .try_get("compression_threshold")
                    .map_err(StoreError::from)?,
                retrieval_k: row.try_get("retrieval_k").map_err(StoreError::from)?,
                temperature: row.try_get("temperature").map_err(StoreError::from)?,
            }),
            None => None,
        })
    }

    async fn prompt_template(&self, prompt_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT template FROM prompt_library WHERE prompt_id = $1 AND active = TRUE",
        )
        .bind(prompt_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(match row {
            Some(row) => Some(row.try_get("template").map_err(StoreError::from)?),
            None => None,
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryWarmStore
// ---------------------------------------------------------------------------

/// Dashmap-backed [`WarmMemoryStore`] for tests and single-process use.
#[derive(Debug, Default)]
pub struct InMemoryWarmStore {
    items: DashMap<String, MemoryItem>,
    profiles: DashMap<String, UserMemoryProfile>,
    agent_settings: DashMap<String, AgentSettings>,
    prompts: DashMap<String, String>,
}

impl InMemoryWarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_agent_settings(&self, agent_type: &str, settings: AgentSettings) {
        self.agent_settings.insert(agent_type.to_string(), settings);
    }

    pub fn insert_prompt(&self, prompt_id: &str, template: &str) {
        self.prompts.insert(prompt_id.to_string(), template.to_string());
    }
}

#[async_trait]
impl WarmMemoryStore for InMemoryWarmStore {
    async fn upsert(&self, item: &MemoryItem) -> Result<()> {
        self.items.insert(item.memory_id(), item.clone());
        Ok(())
    }

    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryItem>> {
        let mut out: Vec<MemoryItem> = self
            .items
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        Ok(out)
    }

    async fn delete(&self, memory_id: &str) -> Result<()> {
        self.items.remove(memory_id);
        Ok(())
    }

    async fn record_retrieval(&self, memory_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut item) = self.items.get_mut(memory_id) {
            item.retrieval_count += 1;
            item.last_retrieved = Some(at);
        }
        Ok(())
    }

    async fn touch_profile(&self, user_id: &str, at: DateTime<Utc>, tier: MemoryTier) -> Result<()> {
        let mut profile = self
            .profiles
            .entry(user_id.to_string())
            .or_insert(UserMemoryProfile {
                user_id: user_id.to_string(),
                last_interaction: None,
                total_interactions: 0,
                memory_tier: None,
                last_memory_consolidation: None,
            });
        profile.last_interaction = Some(at);
        profile.total_interactions += 1;
        profile.memory_tier = Some(tier.as_str().to_string());
        Ok(())
    }

    async fn stamp_consolidation(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut profile) = self.profiles.get_mut(user_id) {
            profile.last_memory_consolidation = Some(at);
        }
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserMemoryProfile>> {
        Ok(self.profiles.get(user_id).map(|p| p.clone()))
    }

    async fn recent_user_ids(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .profiles
            .iter()
            .filter(|e| e.value().last_interaction.is_some_and(|t| t >= since))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn agent_settings(&self, agent_type: &str) -> Result<Option<AgentSettings>> {
        Ok(self.agent_settings.get(agent_type).map(|s| s.clone()))
    }

    async fn prompt_template(&self, prompt_id: &str) -> Result<Option<String>> {
        Ok(self.prompts.get(prompt_id).map(|t| t.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
