use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::warm::{AgentSettings, WarmMemoryStore};
use gr_core::config::MemoryConfig;
use gr_core::types::{MemoryItem, MemoryTier, MemoryType};
use gr_knowledge::EmbeddingService;
use gr_stores::{DocumentFilter, DocumentStore, KeyValueStore, MemoryDocument};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A tier-by-tier account of a partially failed memory operation. Carries
/// whatever the succeeding tiers produced so callers can accept partial
/// results.
#[derive(Debug)]
pub struct PartialFailure {
    pub items: Vec<MemoryItem>,
    pub succeeded: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("partial failure – tiers ok: {:?}, failed: {:?}", .0.succeeded, .0.failed)]
    Partial(PartialFailure),
    #[error("store: {0}")]
    Store(#[from] gr_stores::StoreError),
    #[error("embedding: {0}")]
    Embedding(#[from] gr_knowledge::EmbeddingError),
}

impl From<MemoryError> for gr_core::Error {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::Partial(p) => {
                gr_core::Error::Transient(format!("partial memory failure: {:?}", p.failed))
            }
            MemoryError::Store(s) => s.into(),
            MemoryError::Embedding(emb) => emb.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests / results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RetrieveRequest {
    pub query: Option<String>,
    pub memory_types: Option<Vec<MemoryType>>,
    pub limit: usize,
    pub min_importance: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationStats {
    pub promoted: u32,
    pub demoted: u32,
    pub archived: u32,
    pub compressed: u32,
}

impl ConsolidationStats {
    pub fn is_noop(&self) -> bool {
        *self == ConsolidationStats::default()
    }
}

// ---------------------------------------------------------------------------
// TieredMemoryManager
// ---------------------------------------------------------------------------

/// Places and retrieves [`MemoryItem`]s across the three tiers.
///
/// Hot items live in a per-user KV hash with a rolling TTL; warm items in
/// the relational store; cold and archived items in the document store
/// (with embeddings). Without a document store, the warm store absorbs cold
/// writes and semantic queries return empty.
pub struct TieredMemoryManager {
    kv: Arc<dyn KeyValueStore>,
    warm: Arc<dyn WarmMemoryStore>,
    documents: Option<Arc<dyn DocumentStore>>,
    embeddings: Arc<EmbeddingService>,
    config: MemoryConfig,
}

fn hot_key(user_id: &str) -> String {
    format!("memory:hot:{user_id}")
}

impl TieredMemoryManager {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        warm: Arc<dyn WarmMemoryStore>,
        documents: Option<Arc<dyn DocumentStore>>,
        embeddings: Arc<EmbeddingService>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            kv,
            warm,
            documents,
            embeddings,
            config,
        }
    }

    pub fn has_document_store(&self) -> bool {
        self.documents.is_some()
    }

    // -- storage ------------------------------------------------------------

    /// Store one item; returns its logical memory id. With `auto_tier` the
    /// tier is chosen from age and importance, otherwise the item's own
    /// tier is honored.
    pub async fn store(&self, mut item: MemoryItem, auto_tier: bool) -> Result<String, MemoryError> {
        if auto_tier {
            item.tier = self.determine_tier(&item, Utc::now());
        }
        let memory_id = item.memory_id();

        match item.tier {
            MemoryTier::Hot => self.store_hot(&item).await?,
            MemoryTier::Warm => self.warm.upsert(&item).await?,
            MemoryTier::Cold | MemoryTier::Archived => {
                if self.documents.is_some() {
                    self.store_cold(&mut item).await?;
                } else {
                    // Degraded mode: warm absorbs cold writes.
                    self.warm.upsert(&item).await?;
                }
            }
        }

        self.warm
            .touch_profile(&item.user_id, item.timestamp, item.tier)
            .await?;

        debug!(
            user_id = %item.user_id,
            memory_id,
            tier = item.tier.as_str(),
            "memory stored"
        );
        Ok(memory_id)
    }

    fn determine_tier(&self, item: &MemoryItem, now: DateTime<Utc>) -> MemoryTier {
        let age_days = item.age_days(now);
        if age_days < self.config.hot_tier_days && item.importance >= 0.3 {
            MemoryTier::Hot
        } else if age_days < self.config.warm_tier_days && item.importance >= 0.2 {
            MemoryTier::Warm
        } else {
            MemoryTier::Cold
        }
    }

    async fn store_hot(&self, item: &MemoryItem) -> Result<(), MemoryError> {
        let key = hot_key(&item.user_id);
        let payload = serde_json::to_string(item)
            .map_err(|e| gr_stores::StoreError::Failure(e.to_string()))?;
        self.kv.hset(&key, &item.memory_id(), &payload).await?;
        self.kv
            .expire(&key, Duration::from_secs(self.config.hot_ttl_secs))
            .await?;
        Ok(())
    }

    async fn store_cold(&self, item: &mut MemoryItem) -> Result<(), MemoryError> {
        let documents = self
            .documents
            .as_ref()
            .expect("store_cold requires a document store");
        if item.embedding.is_none() {
            item.embedding = self
                .embeddings
                .embed(&item.content)
                .await?
                .map(|v| v.as_ref().clone());
        }
        documents
            .upsert(MemoryDocument::from_item(item))
            .await?;
        Ok(())
    }

    // -- retrieval ----------------------------------------------------------

    /// Search all tiers concurrently and merge. Hot and warm filter by
    /// substring when a query is present; cold searches semantically via
    /// the query's embedding. Retrieval stats are written through to the
    /// owning tier for every returned item.
    pub async fn retrieve(
        &self,
        user_id: &str,
        req: &RetrieveRequest,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let (hot, warm, cold) = tokio::join!(
            self.search_hot(user_id, req),
            self.search_warm(user_id, req),
            self.search_cold(user_id, req),
        );

        let mut succeeded: Vec<&'static str> = Vec::new();
        let mut failed: Vec<(&'static str, String)> = Vec::new();
        let mut all: Vec<MemoryItem> = Vec::new();

        for (name, result) in [("hot", hot), ("warm", warm), ("cold", cold)] {
            match result {
                Ok(mut items) => {
                    succeeded.push(name);
                    all.append(&mut items);
                }
                Err(e) => {
                    warn!(user_id, tier = name, error = %e, "tier search failed");
                    failed.push((name, e.to_string()));
                }
            }
        }

        // Tier moves are write-then-delete; a reader can briefly see both
        // copies, so dedup on the logical id.
        let mut seen: HashSet<String> = HashSet::new();
        all.retain(|m| seen.insert(m.memory_id()));

        all.retain(|m| m.importance >= req.min_importance);
        all.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        all.truncate(req.limit.max(1));

        let now = Utc::now();
        for item in &mut all {
            item.retrieval_count += 1;
            item.last_retrieved = Some(now);
            if let Err(e) = self.write_retrieval_stats(item, now).await {
                warn!(user_id, error = %e, "retrieval stat write-through failed");
            }
        }

        if failed.is_empty() {
            Ok(all)
        } else {
            Err(MemoryError::Partial(PartialFailure {
                items: all,
                succeeded,
                failed,
            }))
        }
    }

    async fn search_hot(
        &self,
        user_id: &str,
        req: &RetrieveRequest,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let entries = self.kv.hgetall(&hot_key(user_id)).await?;
        let mut out = Vec::new();
        for (field, payload) in entries {
            let item: MemoryItem = match serde_json::from_str(&payload) {
                Ok(item) => item,
                Err(e) => {
                    warn!(user_id, field, error = %e, "unparseable hot memory entry");
                    continue;
                }
            };
            if !matches_filters(&item, req) {
                continue;
            }
            out.push(item);
        }
        Ok(out)
    }

    async fn search_warm(
        &self,
        user_id: &str,
        req: &RetrieveRequest,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let items = self.warm.list(user_id, 1000).await?;
        Ok(items
            .into_iter()
            .filter(|i| matches_filters(i, req))
            .collect())
    }

    async fn search_cold(
        &self,
        user_id: &str,
        req: &RetrieveRequest,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let (Some(documents), Some(query)) = (&self.documents, &req.query) else {
            return Ok(Vec::new());
        };
        let Some(vector) = self.embeddings.embed(query).await? else {
            return Ok(Vec::new());
        };

        let filter = DocumentFilter {
            user_id: Some(user_id.to_string()),
            memory_types: req.memory_types.clone(),
            ..Default::default()
        };
        let scored = documents
            .top_k_by_similarity(&filter, &vector, req.limit.max(1))
            .await?;
        Ok(scored.into_iter().map(|s| s.doc.into_item()).collect())
    }

    async fn write_retrieval_stats(
        &self,
        item: &MemoryItem,
        now: DateTime<Utc>,
    ) -> Result<(), MemoryError> {
        match item.tier {
            MemoryTier::Hot => self.store_hot(item).await,
            MemoryTier::Warm => Ok(self.warm.record_retrieval(&item.memory_id(), now).await?),
            MemoryTier::Cold | MemoryTier::Archived => {
                if let Some(documents) = &self.documents {
                    documents.record_retrieval(&item.memory_id(), now).await?;
                } else {
                    self.warm.record_retrieval(&item.memory_id(), now).await?;
                }
                Ok(())
            }
        }
    }

    // -- consolidation ------------------------------------------------------

    /// Move items between tiers by age and access pattern. Passes run in
    /// order (hot → warm → cold) against fresh listings, so a single run
    /// settles every item and an immediate second run is a no-op.
    pub async fn consolidate(&self, user_id: &str) -> Result<ConsolidationStats, MemoryError> {
        let mut stats = ConsolidationStats::default();
        let now = Utc::now();

        // Hot → warm: aged out or unimportant.
        let hot_items = self
            .search_hot(user_id, &RetrieveRequest::default().with_no_limit())
            .await?;
        for mut item in hot_items {
            if item.age_days(now) > self.config.hot_tier_days || item.importance < 0.3 {
                let memory_id = item.memory_id();
                item.tier = MemoryTier::Warm;
                self.warm.upsert(&item).await?;
                self.kv.hdel(&hot_key(user_id), &memory_id).await?;
                stats.demoted += 1;
            }
        }

        // Warm → cold: aged out or never retrieved. Fresh listing so items
        // demoted above settle in the same run.
        if self.documents.is_some() {
            let warm_items = self.warm.list(user_id, 1000).await?;
            for mut item in warm_items {
                if item.tier != MemoryTier::Warm {
                    continue;
                }
                if item.age_days(now) > self.config.warm_tier_days || item.retrieval_count == 0 {
                    let memory_id = item.memory_id();
                    item.tier = MemoryTier::Cold;
                    match self.store_cold(&mut item).await {
                        Ok(()) => {
                            self.warm.delete(&memory_id).await?;
                            stats.demoted += 1;
                        }
                        Err(e) => {
                            warn!(user_id, memory_id, error = %e, "cold demotion failed");
                            return Err(e);
                        }
                    }
                }
            }

            // Cold → archived in place.
            if let Some(documents) = &self.documents {
                let filter = DocumentFilter::for_user(user_id);
                let cold_docs = documents.find(&filter, 10_000).await?;
                for mut doc in cold_docs {
                    if doc.tier != MemoryTier::Cold {
                        continue;
                    }
                    if (now - doc.timestamp).num_days() > self.config.cold_tier_days {
                        doc.tier = MemoryTier::Archived;
                        if doc.embedding.is_none() {
                            doc.embedding = self
                                .embeddings
                                .embed(&doc.content)
                                .await?
                                .map(|v| v.as_ref().clone());
                        }
                        documents.upsert(doc).await?;
                        stats.archived += 1;
                    }
                }
            }
        }

        self.warm.stamp_consolidation(user_id, now).await?;
        info!(
            user_id,
            demoted = stats.demoted,
            archived = stats.archived,
            "memory consolidation complete"
        );
        Ok(stats)
    }

    /// Drop cold items past the retention age. Runs from a background task.
    pub async fn cleanup_expired(&self, user_id: &str) -> Result<u32, MemoryError> {
        let Some(documents) = &self.documents else {
            return Ok(0);
        };
        let docs = documents.find(&DocumentFilter::for_user(user_id), 10_000).await?;
        let now = Utc::now();
        let mut removed = 0u32;
        for doc in docs {
            if (now - doc.timestamp).num_days() > self.config.retention_days {
                documents.delete(&doc.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Users with memory activity since `since`. The scheduled
    /// consolidation task iterates these.
    pub async fn recent_user_ids(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, MemoryError> {
        Ok(self.warm.recent_user_ids(since).await?)
    }

    // -- agent config & prompt library --------------------------------------

    /// Per-agent settings with documented defaults when no row exists.
    pub async fn agent_settings(&self, agent_type: &str) -> Result<AgentSettings, MemoryError> {
        Ok(self
            .warm
            .agent_settings(agent_type)
            .await?
            .unwrap_or_default())
    }

    /// A prompt template with `{{variable}}` substitution applied. Missing
    /// templates come back as an empty string.
    pub async fn render_prompt(
        &self,
        prompt_id: &str,
        variables: &[(&str, &str)],
    ) -> Result<String, MemoryError> {
        let Some(mut template) = self.warm.prompt_template(prompt_id).await? else {
            warn!(prompt_id, "prompt template not found");
            return Ok(String::new());
        };
        for (key, value) in variables {
            template = template.replace(&format!("{{{{{key}}}}}"), value);
        }
        Ok(template)
    }
}

impl RetrieveRequest {
    fn with_no_limit(mut self) -> Self {
        self.limit = usize::MAX;
        self
    }
}

fn matches_filters(item: &MemoryItem, req: &RetrieveRequest) -> bool {
    if let Some(types) = &req.memory_types {
        if !types.contains(&item.memory_type) {
            return false;
        }
    }
    if let Some(query) = &req.query {
        if !item.content.to_lowercase().contains(&query.to_lowercase()) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warm::InMemoryWarmStore;
    use gr_knowledge::LocalEmbedder;
    use gr_stores::{InMemoryDocumentStore, MemoryKv};

    fn manager(with_documents: bool) -> TieredMemoryManager {
        let documents: Option<Arc<dyn DocumentStore>> = if with_documents {
            Some(Arc::new(InMemoryDocumentStore::new()))
        } else {
            None
        };
        TieredMemoryManager::new(
            Arc::new(MemoryKv::new()),
            Arc::new(InMemoryWarmStore::new()),
            documents,
            Arc::new(EmbeddingService::new(
                Arc::new(LocalEmbedder::new("test")),
                100,
            )),
            MemoryConfig::default(),
        )
    }

    fn aged_item(user: &str, content: &str, days_old: i64, importance: f64) -> MemoryItem {
        let mut item = MemoryItem::new(user, content, MemoryType::Conversation, importance);
        item.timestamp = Utc::now() - chrono::Duration::days(days_old);
        item
    }

    #[tokio::test]
    async fn auto_tier_follows_age_and_importance() {
        let m = manager(true);
        let now = Utc::now();

        assert_eq!(
            m.determine_tier(&aged_item("u", "x", 0, 0.5), now),
            MemoryTier::Hot
        );
        assert_eq!(
            m.determine_tier(&aged_item("u", "x", 0, 0.1), now),
            MemoryTier::Cold
        );
        assert_eq!(
            m.determine_tier(&aged_item("u", "x", 8, 0.4), now),
            MemoryTier::Warm
        );
        assert_eq!(
            m.determine_tier(&aged_item("u", "x", 40, 0.9), now),
            MemoryTier::Cold
        );
    }

    #[tokio::test]
    async fn hot_item_lands_in_kv_hash() {
        let m = manager(true);
        let item = aged_item("u1", "fresh and important", 0, 0.8);
        m.store(item, true).await.unwrap();

        let entries = m.kv.hgetall("memory:hot:u1").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn cold_write_without_document_store_goes_warm() {
        let m = manager(false);
        let item = aged_item("u1", "ancient", 100, 0.9);
        m.store(item, true).await.unwrap();

        let warm = m.warm.list("u1", 10).await.unwrap();
        assert_eq!(warm.len(), 1);
        assert_eq!(warm[0].tier, MemoryTier::Cold);
    }

    #[tokio::test]
    async fn cold_items_carry_embeddings() {
        let m = manager(true);
        let item = aged_item("u1", "ancient memory about sailing", 100, 0.9);
        m.store(item, true).await.unwrap();

        let documents = m.documents.as_ref().unwrap();
        let docs = documents
            .find(&DocumentFilter::for_user("u1"), 10)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].embedding.is_some());
    }

    #[tokio::test]
    async fn retrieve_merges_and_sorts_by_importance() {
        let m = manager(true);
        m.store(aged_item("u1", "low importance note", 0, 0.4), true)
            .await
            .unwrap();
        m.store(aged_item("u1", "high importance note", 8, 0.9), true)
            .await
            .unwrap();

        let req = RetrieveRequest {
            limit: 10,
            ..Default::default()
        };
        let items = m.retrieve("u1", &req).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].importance > items[1].importance);
    }

    #[tokio::test]
    async fn retrieve_filters_by_substring_and_importance() {
        let m = manager(true);
        m.store(aged_item("u1", "likes green tea", 0, 0.6), true)
            .await
            .unwrap();
        m.store(aged_item("u1", "dislikes coffee", 0, 0.6), true)
            .await
            .unwrap();

        let req = RetrieveRequest {
            query: Some("TEA".into()),
            limit: 10,
            ..Default::default()
        };
        let items = m.retrieve("u1", &req).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].content.contains("tea"));

        let req = RetrieveRequest {
            limit: 10,
            min_importance: 0.9,
            ..Default::default()
        };
        assert!(m.retrieve("u1", &req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrieval_increments_stats() {
        let m = manager(true);
        m.store(aged_item("u1", "remembered fact", 0, 0.7), true)
            .await
            .unwrap();

        let req = RetrieveRequest {
            limit: 10,
            ..Default::default()
        };
        let items = m.retrieve("u1", &req).await.unwrap();
        assert_eq!(items[0].retrieval_count, 1);
        assert!(items[0].last_retrieved.is_some());

        // The write-through is visible on the next read.
        let items = m.retrieve("u1", &req).await.unwrap();
        assert_eq!(items[0].retrieval_count, 2);
    }

    #[tokio::test]
    async fn consolidation_demotes_and_is_idempotent() {
        let m = manager(true);

        // Old-but-hot item: forced into the hot tier, overdue for demotion.
        let mut item = aged_item("u1", "stale hot memory", 10, 0.8);
        item.tier = MemoryTier::Hot;
        m.store(item, false).await.unwrap();

        let stats = m.consolidate("u1").await.unwrap();
        // Hot → warm, then the same never-retrieved item settles warm → cold.
        assert_eq!(stats.demoted, 2);
        assert!(m.kv.hgetall("memory:hot:u1").await.unwrap().is_empty());

        let second = m.consolidate("u1").await.unwrap();
        assert!(second.is_noop(), "second run was {second:?}");
    }

    #[tokio::test]
    async fn consolidation_archives_old_cold_items() {
        let m = manager(true);
        let item = aged_item("u1", "very old memory", 120, 0.9);
        m.store(item, true).await.unwrap();

        let stats = m.consolidate("u1").await.unwrap();
        assert_eq!(stats.archived, 1);

        let documents = m.documents.as_ref().unwrap();
        let docs = documents
            .find(&DocumentFilter::for_user("u1"), 10)
            .await
            .unwrap();
        assert_eq!(docs[0].tier, MemoryTier::Archived);
        assert!(docs[0].embedding.is_some());
    }

    #[tokio::test]
    async fn tier_promotion_scenario() {
        // An 8-day-old item of importance 0.4 auto-tiers to WARM; a later
        // consolidation (never retrieved) moves it to COLD where semantic
        // search still finds it and bumps its retrieval count.
        let m = manager(true);
        let item = aged_item("u1", "loves mountain hiking", 8, 0.4);
        m.store(item, true).await.unwrap();

        let warm = m.warm.list("u1", 10).await.unwrap();
        assert_eq!(warm.len(), 1);
        assert_eq!(warm[0].tier, MemoryTier::Warm);

        let stats = m.consolidate("u1").await.unwrap();
        assert_eq!(stats.demoted, 1);
        assert!(m.warm.list("u1", 10).await.unwrap().is_empty());

        let req = RetrieveRequest {
            query: Some("loves".into()),
            limit: 10,
            ..Default::default()
        };
        let items = m.retrieve("u1", &req).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tier, MemoryTier::Cold);
        assert_eq!(items[0].retrieval_count, 1);
    }

    #[tokio::test]
    async fn prompt_rendering_substitutes_variables() {
        let warm = Arc::new(InMemoryWarmStore::new());
        warm.insert_prompt("greeting", "Hello {{name}}, welcome to {{place}}!");
        let m = TieredMemoryManager::new(
            Arc::new(MemoryKv::new()),
            warm,
            None,
            Arc::new(EmbeddingService::new(
                Arc::new(LocalEmbedder::new("test")),
                10,
            )),
            MemoryConfig::default(),
        );

        let rendered = m
            .render_prompt("greeting", &[("name", "Ada"), ("place", "the lab")])
            .await
            .unwrap();
        assert_eq!(rendered, "Hello Ada, welcome to the lab!");

        assert_eq!(m.render_prompt("missing", &[]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn agent_settings_fall_back_to_defaults() {
        let m = manager(false);
        let settings = m.agent_settings("generator").await.unwrap();
        assert_eq!(settings, AgentSettings::default());
    }
}
