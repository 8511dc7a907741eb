use chrono::{DateTime, Utc};

use gr_core::types::RiskRecommendation;

// ---------------------------------------------------------------------------
// PolicyVerdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PolicyVerdict {
    pub risk_score: f64,
    pub risk_flags: Vec<String>,
    pub risk_recommendation: RiskRecommendation,
}

// ---------------------------------------------------------------------------
// PolicyFilter
// ---------------------------------------------------------------------------

/// Deterministic content filter run over the user message and the candidate
/// bubbles before staging. Keyword categories accumulate into a risk score;
/// thresholds map the score to a recommendation.
#[derive(Debug, Clone, Default)]
pub struct PolicyFilter;

struct Category {
    flag: &'static str,
    weight: f64,
    keywords: &'static [&'static str],
}

const CATEGORIES: &[Category] = &[
    Category {
        flag: "self_harm",
        weight: 0.8,
        keywords: &["kill myself", "suicide", "self harm", "end my life"],
    },
    Category {
        flag: "violence",
        weight: 0.5,
        keywords: &["hurt you", "kill you", "weapon", "attack them"],
    },
    Category {
        flag: "financial_request",
        weight: 0.4,
        keywords: &["wire transfer", "gift card", "bank account", "send money", "crypto wallet"],
    },
    Category {
        flag: "pii",
        weight: 0.4,
        keywords: &["social security", "passport number", "credit card number", "password is"],
    },
    Category {
        flag: "explicit",
        weight: 0.3,
        keywords: &["explicit photo", "nude", "sexting"],
    },
];

const REJECT_THRESHOLD: f64 = 0.7;
const REVIEW_THRESHOLD: f64 = 0.3;

impl PolicyFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, user_message: &str, bubbles: &[String]) -> PolicyVerdict {
        let mut haystack = user_message.to_lowercase();
        for bubble in bubbles {
            haystack.push('\n');
            haystack.push_str(&bubble.to_lowercase());
        }

        let mut risk_score = 0.0;
        let mut risk_flags = Vec::new();
        for category in CATEGORIES {
            if category.keywords.iter().any(|kw| haystack.contains(kw)) {
                risk_score += category.weight;
                risk_flags.push(category.flag.to_string());
            }
        }

        // Link spam is a weak signal on its own.
        if haystack.matches("http://").count() + haystack.matches("https://").count() > 2 {
            risk_score += 0.2;
            risk_flags.push("link_spam".to_string());
        }

        let risk_score = risk_score.min(1.0);
        let risk_recommendation = if risk_score >= REJECT_THRESHOLD {
            RiskRecommendation::Reject
        } else if risk_score >= REVIEW_THRESHOLD {
            RiskRecommendation::Review
        } else {
            RiskRecommendation::Approve
        };

        PolicyVerdict {
            risk_score,
            risk_flags,
            risk_recommendation,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring heuristics
// ---------------------------------------------------------------------------

/// How long a turn keeps its freshness bonus in the review queue.
const RECENCY_WINDOW_SECS: f64 = 3600.0;

/// Queue weight for a freshly staged interaction, fixed at creation:
/// `0.5·risk-review bias + 0.3·length + 0.2·recency`. Turns the filter
/// wants human eyes on outrank clean ones even at a low raw score, and a
/// backlog drains oldest-risk-first as the recency bonus decays away over
/// the first hour.
pub fn priority_score(
    verdict: &PolicyVerdict,
    user_message: &str,
    received_at: DateTime<Utc>,
) -> f64 {
    let risk_bias = match verdict.risk_recommendation {
        RiskRecommendation::Reject => 1.0,
        RiskRecommendation::Review => verdict.risk_score.max(0.5),
        RiskRecommendation::Approve => verdict.risk_score,
    };
    let length_signal = (user_message.chars().count() as f64 / 400.0).min(1.0);
    let age_secs = (Utc::now() - received_at).num_seconds().max(0) as f64;
    let recency = (1.0 - age_secs / RECENCY_WINDOW_SECS).clamp(0.0, 1.0);

    0.5 * risk_bias + 0.3 * length_signal + 0.2 * recency
}

const EMOTIONAL_KEYWORDS: &[&str] = &[
    "love", "hate", "happy", "sad", "angry", "excited", "worried", "afraid", "miss", "lonely",
];

/// Memory importance for a delivered conversation turn: base 0.3, up to
/// +0.5 from length and named-entity signals, up to +0.2 from emotional
/// keywords, clamped to [0, 1].
pub fn importance_heuristic(text: &str) -> f64 {
    let base = 0.3;

    let length_part = (text.chars().count() as f64 / 800.0) * 0.3;
    let entities = text
        .split_whitespace()
        .filter(|w| {
            w.chars().next().is_some_and(|c| c.is_uppercase())
                || w.chars().all(|c| c.is_ascii_digit())
        })
        .count();
    let entity_part = (entities as f64) * 0.05;
    let signal = (length_part + entity_part).min(0.5);

    let lowered = text.to_lowercase();
    let emotional = EMOTIONAL_KEYWORDS
        .iter()
        .filter(|kw| lowered.contains(*kw))
        .count() as f64
        * 0.05;
    let emotional = emotional.min(0.2);

    (base + signal + emotional).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
