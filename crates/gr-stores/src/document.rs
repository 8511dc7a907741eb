use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use gr_core::types::{MemoryItem, MemoryTier, MemoryType, Metadata};

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

/// A document in the cold tier: an archival memory or a knowledge-base
/// entry. Knowledge documents carry a `title`/`category`; memories carry
/// tier and retrieval bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDocument {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub tier: MemoryTier,
    #[serde(default)]
    pub metadata: Metadata,
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub retrieval_count: u32,
    #[serde(default)]
    pub last_retrieved: Option<DateTime<Utc>>,
}

impl MemoryDocument {
    pub fn from_item(item: &MemoryItem) -> Self {
        Self {
            id: item.memory_id(),
            user_id: item.user_id.clone(),
            title: None,
            category: None,
            content: item.content.clone(),
            timestamp: item.timestamp,
            memory_type: item.memory_type,
            importance: item.importance,
            tier: item.tier,
            metadata: item.metadata.clone(),
            embedding: item.embedding.clone(),
            retrieval_count: item.retrieval_count,
            last_retrieved: item.last_retrieved,
        }
    }

    pub fn into_item(self) -> MemoryItem {
        MemoryItem {
            user_id: self.user_id,
            content: self.content,
            timestamp: self.timestamp,
            memory_type: self.memory_type,
            importance: self.importance,
            tier: self.tier,
            metadata: self.metadata,
            embedding: self.embedding,
            retrieval_count: self.retrieval_count,
            last_retrieved: self.last_retrieved,
        }
    }
}

/// Filter for document lookups. All present fields must match.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub user_id: Option<String>,
    pub category: Option<String>,
    pub memory_types: Option<Vec<MemoryType>>,
    /// Case-insensitive containment against title and content.
    pub text: Option<String>,
    pub max_age_days: Option<i64>,
}

impl DocumentFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    fn matches(&self, doc: &MemoryDocument, now: DateTime<Utc>) -> bool {
        if let Some(uid) = &self.user_id {
            if &doc.user_id != uid {
                return false;
            }
        }
        if let Some(cat) = &self.category {
            if doc.category.as_deref() != Some(cat.as_str()) {
                return false;
            }
        }
        if let Some(types) = &self.memory_types {
            if !types.contains(&doc.memory_type) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let in_title = doc
                .title
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains(&needle));
            if !in_title && !doc.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        if let Some(max_age) = self.max_age_days {
            if (now - doc.timestamp).num_days() > max_age {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub doc: MemoryDocument,
    pub score: f32,
}

// ---------------------------------------------------------------------------
// DocumentStore trait
// ---------------------------------------------------------------------------

/// Cold-tier contract. The scoring primitive computes a dot product between
/// each stored embedding and the query vector and returns the top K — on
/// unit-normalized vectors that is cosine similarity.
///
/// The subsystem is optional: consumers hold `Option<Arc<dyn DocumentStore>>`
/// and degrade (cold writes land in the warm store, semantic search returns
/// empty) when it is absent.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn upsert(&self, doc: MemoryDocument) -> Result<()>;

    async fn find(&self, filter: &DocumentFilter, limit: usize) -> Result<Vec<MemoryDocument>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    /// Top-K documents by dot-product score against `query`, highest first.
    /// Documents without an embedding are skipped.
    async fn top_k_by_similarity(
        &self,
        filter: &DocumentFilter,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredDocument>>;

    /// Write-through retrieval bookkeeping.
    async fn record_retrieval(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// InMemoryDocumentStore
// ---------------------------------------------------------------------------

/// Process-local [`DocumentStore`]. Serves tests, development, and
/// deployments without an external document database; an external backend
/// slots behind the same trait.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    docs: DashMap<String, MemoryDocument>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, doc: MemoryDocument) -> Result<()> {
        self.docs.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn find(&self, filter: &DocumentFilter, limit: usize) -> Result<Vec<MemoryDocument>> {
        let now = Utc::now();
        let mut out: Vec<MemoryDocument> = self
            .docs
            .iter()
            .filter(|e| filter.matches(e.value(), now))
            .map(|e| e.value().clone())
            .collect();
        // Newest first, stable under repeat queries.
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.docs.remove(id).is_some())
    }

    async fn top_k_by_similarity(
        &self,
        filter: &DocumentFilter,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredDocument>> {
        let now = Utc::now();
        let mut scored: Vec<ScoredDocument> = self
            .docs
            .iter()
            .filter(|e| filter.matches(e.value(), now))
            .filter_map(|e| {
                let emb = e.value().embedding.as_ref()?;
                if emb.len() != query.len() {
                    return None;
                }
                Some(ScoredDocument {
                    doc: e.value().clone(),
                    score: dot(emb, query),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn record_retrieval(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut doc) = self.docs.get_mut(id) {
            doc.retrieval_count += 1;
            doc.last_retrieved = Some(at);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
