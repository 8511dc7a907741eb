use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::embeddings::EmbeddingService;
use gr_core::types::MemoryType;
use gr_stores::{DocumentFilter, DocumentStore, ScoredDocument};

/// User id under which the global biographical corpus is stored.
pub const GLOBAL_CORPUS_USER: &str = "global";

// ---------------------------------------------------------------------------
// Config / output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Max knowledge documents injected into the prompt.
    pub max_documents: usize,
    /// Per-backend document relevance threshold (τ).
    pub similarity_threshold: f64,
    /// Threshold for related conversation history.
    pub history_similarity_threshold: f64,
    /// Hard bound on the assembled context summary.
    pub max_context_chars: usize,
    /// Below this the original message goes out unenhanced.
    pub min_confidence: f64,
    pub preview_chars: usize,
    pub max_interests: usize,
    pub max_history_topics: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_documents: 3,
            similarity_threshold: 0.6,
            history_similarity_threshold: 0.6,
            max_context_chars: 2000,
            min_confidence: 0.3,
            preview_chars: 200,
            max_interests: 5,
            max_history_topics: 2,
        }
    }
}

/// Result of a context-building pass. Always usable: failures degrade to
/// the original message rather than erroring the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Enhancement {
    pub enhanced_text: String,
    #[serde(skip)]
    pub relevant_documents: Vec<ScoredDocument>,
    pub confidence: f64,
    pub success: bool,
}

impl Enhancement {
    fn passthrough(message: &str, success: bool) -> Self {
        Self {
            enhanced_text: message.to_string(),
            relevant_documents: Vec::new(),
            confidence: 0.0,
            success,
        }
    }
}

// ---------------------------------------------------------------------------
// ContextBuilder
// ---------------------------------------------------------------------------

/// Assembles prompt-augmenting context for a user message from the
/// document store: relevant knowledge documents, user preferences, and
/// related conversation history.
pub struct ContextBuilder {
    embeddings: Arc<EmbeddingService>,
    documents: Option<Arc<dyn DocumentStore>>,
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(
        embeddings: Arc<EmbeddingService>,
        documents: Option<Arc<dyn DocumentStore>>,
        config: ContextConfig,
    ) -> Self {
        Self {
            embeddings,
            documents,
            config,
        }
    }

    /// Build an [`Enhancement`] for `user_message`.
    pub async fn build(&self, user_id: &str, user_message: &str) -> Enhancement {
        let query = match self.embeddings.embed(user_message).await {
            Ok(Some(v)) => v,
            Ok(None) => return Enhancement::passthrough(user_message, true),
            Err(e) => {
                warn!(user_id, error = %e, "context embedding failed");
                return Enhancement::passthrough(user_message, false);
            }
        };

        let Some(documents) = &self.documents else {
            return Enhancement::passthrough(user_message, true);
        };

        // Relevant knowledge: user-scoped documents plus the global corpus.
        let mut candidates = Vec::new();
        for scope in [user_id, GLOBAL_CORPUS_USER] {
            let filter = DocumentFilter {
                user_id: Some(scope.to_string()),
                memory_types: Some(vec![MemoryType::Factual]),
                ..Default::default()
            };
            match documents
                .top_k_by_similarity(&filter, &query, self.config.max_documents)
                .await
            {
                Ok(mut found) => candidates.append(&mut found),
                Err(e) => {
                    warn!(user_id, scope, error = %e, "knowledge lookup failed");
                }
            }
        }
        candidates.retain(|d| d.score as f64 >= self.config.similarity_threshold);
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.config.max_documents);

        // User preferences.
        let prefs_filter = DocumentFilter {
            user_id: Some(user_id.to_string()),
            memory_types: Some(vec![MemoryType::Preference]),
            ..Default::default()
        };
        let interests: Vec<String> = match documents.find(&prefs_filter, self.config.max_interests).await
        {
            Ok(docs) => docs.into_iter().map(|d| d.content).collect(),
            Err(e) => {
                warn!(user_id, error = %e, "preference lookup failed");
                Vec::new()
            }
        };

        // Related conversation history.
        let history_filter = DocumentFilter {
            user_id: Some(user_id.to_string()),
            memory_types: Some(vec![MemoryType::Conversation]),
            ..Default::default()
        };
        let history: Vec<ScoredDocument> = match documents
            .top_k_by_similarity(&history_filter, &query, 3)
            .await
        {
            Ok(found) => found
                .into_iter()
                .filter(|d| d.score as f64 >= self.config.history_similarity_threshold)
                .collect(),
            Err(e) => {
                warn!(user_id, error = %e, "history lookup failed");
                Vec::new()
            }
        };

        let confidence = self.confidence(&candidates, !interests.is_empty(), &history);

        if confidence < self.config.min_confidence {
            debug!(user_id, confidence, "context confidence below gate");
            let mut out = Enhancement::passthrough(user_message, true);
            out.confidence = confidence;
            out.relevant_documents = candidates;
            return out;
        }

        let summary = self.summarize(&candidates, &interests, &history);
        let enhanced_text = format!(
            "User Message: {user_message}\n\n\
             Relevant Context:\n{summary}\n\n\
             Instructions: Use the context above only where it is genuinely \
             relevant to the user's message."
        );

        Enhancement {
            enhanced_text,
            relevant_documents: candidates,
            confidence,
            success: true,
        }
    }

    fn confidence(
        &self,
        docs: &[ScoredDocument],
        has_preferences: bool,
        history: &[ScoredDocument],
    ) -> f64 {
        let mean = |xs: &[ScoredDocument]| -> f64 {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().map(|d| d.score as f64).sum::<f64>() / xs.len() as f64
            }
        };
        let score =
            0.6 * mean(docs) + 0.2 * (has_preferences as u8 as f64) + 0.2 * mean(history);
        score.min(1.0)
    }

    fn summarize(
        &self,
        docs: &[ScoredDocument],
        interests: &[String],
        history: &[ScoredDocument],
    ) -> String {
        let mut out = String::new();

        if !docs.is_empty() {
            out.push_str("Relevant Knowledge:\n");
            for d in docs {
                let title = d.doc.title.as_deref().unwrap_or("(untitled)");
                let preview: String = d.doc.content.chars().take(self.config.preview_chars).collect();
                out.push_str(&format!("- {title}: {preview}\n"));
            }
        }

        if !interests.is_empty() {
            out.push_str("User Interests:\n");
            for interest in interests.iter().take(self.config.max_interests) {
                out.push_str(&format!("- {interest}\n"));
            }
        }

        if !history.is_empty() {
            out.push_str("Related Previous Topics:\n");
            for h in history.iter().take(self.config.max_history_topics) {
                let preview: String = h.doc.content.chars().take(self.config.preview_chars).collect();
                out.push_str(&format!("- {preview}\n"));
            }
        }

        if out.chars().count() > self.config.max_context_chars {
            let mut truncated: String = out
                .chars()
                .take(self.config.max_context_chars.saturating_sub(1))
                .collect();
            truncated.push('…');
            return truncated;
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
