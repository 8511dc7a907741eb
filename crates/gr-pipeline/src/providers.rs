use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("provider api error: {0}")]
    Api(String),
    #[error("provider rate limited – retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("provider request timed out")]
    Timeout,
}

impl From<ProviderError> for gr_core::Error {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::RateLimited { retry_after_secs } => {
                gr_core::Error::RateLimited { retry_after_secs }
            }
            ProviderError::Timeout => gr_core::Error::Transient("provider timeout".into()),
            ProviderError::Api(msg) => gr_core::Error::Transient(msg),
            ProviderError::NotConfigured(msg) => gr_core::Error::Failure(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider traits
// ---------------------------------------------------------------------------

/// Stage-one model: produces the creative draft for an enhanced prompt.
///
/// Concrete wire formats live in integration crates; this crate only cares
/// about the contract. [`EchoGenerator`] serves development and tests.
#[async_trait]
pub trait DraftGenerator: Send + Sync {
    async fn draft(&self, prompt: &str) -> Result<String, ProviderError>;
    fn name(&self) -> &str;
}

/// Stage-two model: turns a draft into an ordered list of chat bubbles.
#[async_trait]
pub trait BubbleRefiner: Send + Sync {
    async fn refine(&self, draft: &str) -> Result<Vec<String>, ProviderError>;
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// StubGenerator
// ---------------------------------------------------------------------------

/// Placeholder that fails every call. Wire a real provider in its place.
#[derive(Debug, Clone)]
pub struct StubGenerator {
    provider_name: String,
}

impl StubGenerator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            provider_name: name.into(),
        }
    }
}

#[async_trait]
impl DraftGenerator for StubGenerator {
    async fn draft(&self, _prompt: &str) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "{} is not configured – install a concrete generator",
            self.provider_name
        )))
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}

// ---------------------------------------------------------------------------
// EchoGenerator
// ---------------------------------------------------------------------------

/// Deterministic generator for development runs and tests: reflects the
/// user's message back in a fixed phrasing.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator;

#[async_trait]
impl DraftGenerator for EchoGenerator {
    async fn draft(&self, prompt: &str) -> Result<String, ProviderError> {
        // The enhanced prompt embeds the raw message; draft from its first
        // line so context blocks don't leak into the reply.
        let message = prompt
            .lines()
            .next()
            .unwrap_or(prompt)
            .trim_start_matches("User Message:")
            .trim();
        Ok(format!("Thinking about \"{message}\". Tell me more."))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

// ---------------------------------------------------------------------------
// SentenceSplitRefiner
// ---------------------------------------------------------------------------

/// Deterministic refiner: splits a draft into at most `max_bubbles` chat
/// bubbles on sentence boundaries.
#[derive(Debug, Clone)]
pub struct SentenceSplitRefiner {
    max_bubbles: usize,
}

impl SentenceSplitRefiner {
    pub fn new(max_bubbles: usize) -> Self {
        Self {
            max_bubbles: max_bubbles.max(1),
        }
    }
}

impl Default for SentenceSplitRefiner {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl BubbleRefiner for SentenceSplitRefiner {
    async fn refine(&self, draft: &str) -> Result<Vec<String>, ProviderError> {
        let mut bubbles: Vec<String> = Vec::new();
        let mut current = String::new();

        for ch in draft.chars() {
            current.push(ch);
            if matches!(ch, '.' | '!' | '?') && bubbles.len() + 1 < self.max_bubbles {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    bubbles.push(trimmed.to_string());
                }
                current.clear();
            }
        }
        let tail = current.trim();
        if !tail.is_empty() {
            bubbles.push(tail.to_string());
        }

        if bubbles.is_empty() {
            return Err(ProviderError::Api("refiner produced no bubbles".into()));
        }
        Ok(bubbles)
    }

    fn name(&self) -> &str {
        "sentence-split"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_always_fails() {
        let gen = StubGenerator::new("anthropic");
        assert!(matches!(
            gen.draft("hi").await.unwrap_err(),
            ProviderError::NotConfigured(_)
        ));
    }

    #[tokio::test]
    async fn echo_reflects_the_message() {
        let gen = EchoGenerator;
        let draft = gen.draft("User Message: hello there").await.unwrap();
        assert!(draft.contains("hello there"));
    }

    #[tokio::test]
    async fn refiner_splits_on_sentences() {
        let refiner = SentenceSplitRefiner::new(3);
        let bubbles = refiner
            .refine("First thought. Second thought! And everything else after that")
            .await
            .unwrap();
        assert_eq!(bubbles.len(), 3);
        assert_eq!(bubbles[0], "First thought.");
        assert_eq!(bubbles[1], "Second thought!");
    }

    #[tokio::test]
    async fn refiner_caps_bubble_count() {
        let refiner = SentenceSplitRefiner::new(2);
        let bubbles = refiner.refine("One. Two. Three. Four.").await.unwrap();
        assert_eq!(bubbles.len(), 2);
        assert_eq!(bubbles[1], "Two. Three. Four.");
    }

    #[tokio::test]
    async fn empty_draft_is_an_error() {
        let refiner = SentenceSplitRefiner::default();
        assert!(refiner.refine("   ").await.is_err());
    }

    #[test]
    fn provider_errors_map_into_taxonomy() {
        let e: gr_core::Error = ProviderError::RateLimited {
            retry_after_secs: 10,
        }
        .into();
        assert!(e.is_retryable());

        let e: gr_core::Error = ProviderError::Timeout.into();
        assert!(e.is_retryable());

        let e: gr_core::Error = ProviderError::NotConfigured("x".into()).into();
        assert!(!e.is_retryable());
    }
}
