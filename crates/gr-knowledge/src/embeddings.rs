use std::sync::Arc;

use ahash::AHasher;
use async_trait::async_trait;
use lru::LruCache;
use serde::Deserialize;
use std::hash::{Hash, Hasher};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding api error: {0}")]
    Api(String),
    #[error("embedding provider rate limited – retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
}

impl From<EmbeddingError> for gr_core::Error {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::RateLimited { retry_after_secs } => {
                gr_core::Error::RateLimited { retry_after_secs }
            }
            EmbeddingError::Timeout => gr_core::Error::Transient("embedding timeout".into()),
            EmbeddingError::Unavailable(msg) => gr_core::Error::Transient(msg),
            EmbeddingError::Api(msg) => gr_core::Error::Failure(msg),
        }
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EmbeddingError::Timeout
        } else if e.is_connect() {
            EmbeddingError::Unavailable(e.to_string())
        } else {
            EmbeddingError::Api(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// EmbeddingBackend trait
// ---------------------------------------------------------------------------

/// A black-box `embed(text) → vector` function. Both implementations return
/// unit-normalized vectors of a dimension that is constant at runtime.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;
    fn dimension(&self) -> usize;
    /// Inputs longer than this are truncated before embedding.
    fn max_input_chars(&self) -> usize;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// LocalEmbedder
// ---------------------------------------------------------------------------

/// In-process embedder: a hashed bag of word and character-trigram features
/// projected into a fixed-dimension space and L2-normalized.
///
/// Deterministic and cheap, with the same contract as the remote backend.
/// The model is a single shared instance, so calls are serialized by a
/// mutex; callers amortize by batching (chunks of [`LOCAL_BATCH_SIZE`]).
pub struct LocalEmbedder {
    model_name: String,
    dimension: usize,
    lock: AsyncMutex<()>,
}

const LOCAL_BATCH_SIZE: usize = 32;
const LOCAL_DIMENSION: usize = 384;
const LOCAL_MAX_CHARS: usize = 1024;

impl LocalEmbedder {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            dimension: LOCAL_DIMENSION,
            lock: AsyncMutex::new(()),
        }
    }

    fn feature_index(&self, token: &str) -> usize {
        let mut h = AHasher::default();
        token.hash(&mut h);
        (h.finish() as usize) % self.dimension
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();

        for word in lowered.split_whitespace() {
            v[self.feature_index(word)] += 1.0;
            let chars: Vec<char> = word.chars().collect();
            if chars.len() >= 3 {
                for w in chars.windows(3) {
                    let gram: String = w.iter().collect();
                    v[self.feature_index(&gram)] += 0.5;
                }
            }
        }

        normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingBackend for LocalEmbedder {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_input_chars(&self) -> usize {
        LOCAL_MAX_CHARS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        // Single model instance: serialize access like any CPU-bound model.
        let _guard = self.lock.lock().await;
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(LOCAL_BATCH_SIZE) {
            for text in chunk {
                out.push(self.embed_one(text));
            }
            // Yield between chunks so long batches don't starve the runtime.
            tokio::task::yield_now().await;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// RemoteEmbedder
// ---------------------------------------------------------------------------

/// Remote embedding provider over HTTP. Costs per call and may rate-limit;
/// responses are re-normalized defensively on receipt.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

const REMOTE_MAX_CHARS: usize = 8000;

#[derive(Deserialize)]
struct RemoteEmbeddingResponse {
    data: Vec<RemoteEmbeddingRow>,
}

#[derive(Deserialize)]
struct RemoteEmbeddingRow {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for RemoteEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_input_chars(&self) -> usize {
        REMOTE_MAX_CHARS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30);
            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api(format!("status {status}: {text}")));
        }

        let parsed: RemoteEmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Api(e.to_string()))?;

        let mut out = Vec::with_capacity(parsed.data.len());
        for row in parsed.data {
            let mut v = row.embedding;
            if v.len() != self.dimension {
                return Err(EmbeddingError::Api(format!(
                    "provider returned dimension {} (expected {})",
                    v.len(),
                    self.dimension
                )));
            }
            normalize(&mut v);
            out.push(v);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// EmbeddingService
// ---------------------------------------------------------------------------

/// Caching front over an [`EmbeddingBackend`].
///
/// Empty or whitespace-only input yields `None`. Overlong input is
/// truncated to the backend's limit. The cache is bounded; when full, the
/// oldest eighth of entries is dropped in one batch so eviction cost stays
/// amortized.
pub struct EmbeddingService {
    backend: Arc<dyn EmbeddingBackend>,
    cache: std::sync::Mutex<LruCache<String, Arc<Vec<f32>>>>,
    capacity: usize,
}

impl EmbeddingService {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, cache_capacity: usize) -> Self {
        Self {
            backend,
            cache: std::sync::Mutex::new(LruCache::unbounded()),
            capacity: cache_capacity.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("embedding cache lock").len()
    }

    fn prepare(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let limit = self.backend.max_input_chars();
        if trimmed.chars().count() > limit {
            debug!(limit, "truncating overlong embedding input");
            Some(trimmed.chars().take(limit).collect())
        } else {
            Some(trimmed.to_string())
        }
    }

    fn cache_get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        let mut cache = self.cache.lock().expect("embedding cache lock");
        cache.get(key).cloned()
    }

    fn cache_put(&self, key: String, value: Arc<Vec<f32>>) {
        let mut cache = self.cache.lock().expect("embedding cache lock");
        if cache.len() >= self.capacity {
            // Batched eviction: drop the oldest ~12% in one sweep.
            let drop_count = (self.capacity / 8).max(1);
            for _ in 0..drop_count {
                if cache.pop_lru().is_none() {
                    break;
                }
            }
            debug!(dropped = drop_count, "embedding cache eviction sweep");
        }
        cache.put(key, value);
    }

    /// Embed one text. `None` for empty/whitespace input.
    pub async fn embed(&self, text: &str) -> Result<Option<Arc<Vec<f32>>>, EmbeddingError> {
        let Some(prepared) = self.prepare(text) else {
            return Ok(None);
        };

        if let Some(hit) = self.cache_get(&prepared) {
            return Ok(Some(hit));
        }

        let mut vectors = self.backend.embed_batch(std::slice::from_ref(&prepared)).await?;
        let vector = Arc::new(vectors.remove(0));
        self.cache_put(prepared, vector.clone());
        Ok(Some(vector))
    }

    /// Embed many texts, preserving positions. Cached entries are not
    /// re-requested; empty inputs come back as `None`.
    pub async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Option<Arc<Vec<f32>>>>, EmbeddingError> {
        let mut out: Vec<Option<Arc<Vec<f32>>>> = vec![None; texts.len()];
        let mut missing: Vec<(usize, String)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(prepared) = self.prepare(text) {
                if let Some(hit) = self.cache_get(&prepared) {
                    out[i] = Some(hit);
                } else {
                    missing.push((i, prepared));
                }
            }
        }

        if !missing.is_empty() {
            let inputs: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.backend.embed_batch(&inputs).await?;
            if vectors.len() != inputs.len() {
                warn!(
                    requested = inputs.len(),
                    received = vectors.len(),
                    "embedding backend returned short batch"
                );
                return Err(EmbeddingError::Api("short batch from backend".into()));
            }
            for ((i, prepared), vector) in missing.into_iter().zip(vectors) {
                let vector = Arc::new(vector);
                self.cache_put(prepared, vector.clone());
                out[i] = Some(vector);
            }
        }

        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn service(capacity: usize) -> EmbeddingService {
        EmbeddingService::new(Arc::new(LocalEmbedder::new("test-model")), capacity)
    }

    #[tokio::test]
    async fn vectors_are_unit_normalized() {
        let svc = service(100);
        let v = svc.embed("the quick brown fox").await.unwrap().unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm was {norm}");
    }

    #[tokio::test]
    async fn empty_input_yields_none() {
        let svc = service(100);
        assert!(svc.embed("").await.unwrap().is_none());
        assert!(svc.embed("   \n\t ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deterministic_and_cached() {
        let svc = service(100);
        let a = svc.embed("hello world").await.unwrap().unwrap();
        let b = svc.embed("hello world").await.unwrap().unwrap();
        // Same Arc back from the cache.
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(svc.cache_len(), 1);
    }

    #[tokio::test]
    async fn identical_text_has_similarity_one() {
        let svc = service(100);
        let a = svc.embed("likes hiking in the mountains").await.unwrap().unwrap();
        let b = svc.embed("likes hiking in the mountains").await.unwrap().unwrap();
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        assert!((dot - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn different_text_has_lower_similarity() {
        let svc = service(100);
        let a = svc.embed("likes hiking in the mountains").await.unwrap().unwrap();
        let b = svc.embed("quarterly revenue projections").await.unwrap().unwrap();
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        assert!(dot < 0.9);
    }

    #[tokio::test]
    async fn cache_evicts_in_batches() {
        let svc = service(16);
        for i in 0..16 {
            svc.embed(&format!("text number {i}")).await.unwrap();
        }
        assert_eq!(svc.cache_len(), 16);

        // One more insert triggers a sweep of capacity/8 = 2 entries.
        svc.embed("one more").await.unwrap();
        assert_eq!(svc.cache_len(), 15);
    }

    #[tokio::test]
    async fn batch_preserves_positions() {
        let svc = service(100);
        let texts = vec!["alpha".to_string(), "".to_string(), "gamma".to_string()];
        let out = svc.embed_batch(&texts).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].is_some());
        assert!(out[1].is_none());
        assert!(out[2].is_some());
    }

    #[tokio::test]
    async fn overlong_input_is_truncated_not_rejected() {
        let svc = service(100);
        let long = "word ".repeat(10_000);
        let v = svc.embed(&long).await.unwrap();
        assert!(v.is_some());
    }
}
