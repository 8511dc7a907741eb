use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Physical placement category for a [`MemoryItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// KV store – immediate access, recent conversations.
    Hot,
    /// Relational store – structured data, frequent access.
    Warm,
    /// Document store – archival, semantic search.
    Cold,
    /// Long-term storage, rarely accessed.
    Archived,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Hot => "hot",
            MemoryTier::Warm => "warm",
            MemoryTier::Cold => "cold",
            MemoryTier::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Conversation,
    Preference,
    Emotional,
    Factual,
    Test,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Conversation => "conversation",
            MemoryType::Preference => "preference",
            MemoryType::Emotional => "emotional",
            MemoryType::Factual => "factual",
            MemoryType::Test => "test",
        }
    }
}

/// A scalar-ish metadata value. Free-form mappings from the wire are kept
/// typed instead of `serde_json::Value` so stores can rely on the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// A single remembered fact or conversation fragment, uniform across all
/// storage tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub user_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub memory_type: MemoryType,
    /// Relevance weight in `[0.0, 1.0]`.
    pub importance: f64,
    pub tier: MemoryTier,
    #[serde(default)]
    pub metadata: Metadata,
    /// Unit-normalized embedding of `content`. Required for archived items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub retrieval_count: u32,
    #[serde(default)]
    pub last_retrieved: Option<DateTime<Utc>>,
}

impl MemoryItem {
    pub fn new(
        user_id: impl Into<String>,
        content: impl Into<String>,
        memory_type: MemoryType,
        importance: f64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            memory_type,
            importance: importance.clamp(0.0, 1.0),
            tier: MemoryTier::Hot,
            metadata: Metadata::new(),
            embedding: None,
            retrieval_count: 0,
            last_retrieved: None,
        }
    }

    /// Logical id: stable across tier moves, derived from owner + creation
    /// second. Retrieval dedup and cross-tier deletes key on this.
    pub fn memory_id(&self) -> String {
        format!("{}_{}", self.user_id, self.timestamp.timestamp())
    }

    /// Age in whole days relative to `now`.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_days()
    }
}

// ---------------------------------------------------------------------------
// Interaction / review
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    InReview,
    Approved,
    Rejected,
    Delivered,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::InReview => "in_review",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Delivered => "delivered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRecommendation {
    Approve,
    Review,
    Reject,
}

/// The whole record of one user turn: the incoming message, the generated
/// candidate reply, and its review outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    pub user_id: String,
    pub user_message: String,
    pub raw_generation: String,
    /// Candidate reply split into chat bubbles, in emission order.
    pub refined_bubbles: Vec<String>,
    pub risk_score: f64,
    pub risk_flags: Vec<String>,
    pub risk_recommendation: RiskRecommendation,
    /// Queue ordering weight; fixed at creation.
    pub priority_score: f64,
    pub review_status: ReviewStatus,
    pub reviewer_id: Option<String>,
    pub edit_tags: Vec<String>,
    /// Populated on approval; what actually goes out.
    pub final_bubbles: Option<Vec<String>>,
    pub quality_score: Option<i16>,
    pub reviewer_notes: Option<String>,
    /// Set on user-level cancellation: the row stays for audit but the
    /// delivery worker must skip it.
    #[serde(default)]
    pub delivery_hold: bool,
    pub created_at: DateTime<Utc>,
    pub review_started_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Interaction {
    /// A fresh pending interaction as staged by the pipeline.
    pub fn pending(
        user_id: impl Into<String>,
        user_message: impl Into<String>,
        raw_generation: impl Into<String>,
        refined_bubbles: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            user_message: user_message.into(),
            raw_generation: raw_generation.into(),
            refined_bubbles,
            risk_score: 0.0,
            risk_flags: Vec::new(),
            risk_recommendation: RiskRecommendation::Review,
            priority_score: 0.0,
            review_status: ReviewStatus::Pending,
            reviewer_id: None,
            edit_tags: Vec::new(),
            final_bubbles: None,
            quality_score: None,
            reviewer_notes: None,
            delivery_hold: false,
            created_at: Utc::now(),
            review_started_at: None,
            decided_at: None,
            delivered_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Silence protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolStatus {
    Active,
    Inactive,
}

impl ProtocolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolStatus::Active => "ACTIVE",
            ProtocolStatus::Inactive => "INACTIVE",
        }
    }
}

/// Per-user admission-control state. While `status` is ACTIVE, inbound
/// messages are quarantined instead of generating replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolState {
    pub user_id: String,
    pub status: ProtocolStatus,
    pub activated_by: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub messages_quarantined: i64,
    pub cost_saved: f64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProtocolState {
    pub fn inactive(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status: ProtocolStatus::Inactive,
            activated_by: None,
            activated_at: None,
            reason: None,
            messages_quarantined: 0,
            cost_saved: 0.0,
            last_message_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// A message received while its sender's protocol was ACTIVE, parked for
/// reviewer disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineMessage {
    pub id: Uuid,
    pub user_id: String,
    pub text: String,
    pub external_message_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Activate,
    Deactivate,
    OneTimePass,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Activate => "ACTIVATE",
            AuditAction::Deactivate => "DEACTIVATE",
            AuditAction::OneTimePass => "ONE_TIME_PASS",
        }
    }
}

/// Append-only record of a protocol action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: String,
    pub action: AuditAction,
    pub performed_by: String,
    pub reason: Option<String>,
    pub previous_status: ProtocolStatus,
    pub new_status: ProtocolStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Identity / roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Reviewer,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Reviewer => "reviewer",
            Role::Viewer => "viewer",
        }
    }
}

/// An authenticated principal resolved from a Bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub role: Role,
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// A raw inbound chat message entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    pub text: String,
    pub external_message_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            external_message_id: None,
            received_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&MemoryTier::Hot).unwrap(), "\"hot\"");
        let t: MemoryTier = serde_json::from_str("\"archived\"").unwrap();
        assert_eq!(t, MemoryTier::Archived);
    }

    #[test]
    fn review_status_round_trip() {
        let s: ReviewStatus = serde_json::from_str("\"in_review\"").unwrap();
        assert_eq!(s, ReviewStatus::InReview);
        assert_eq!(s.as_str(), "in_review");
    }

    #[test]
    fn memory_id_is_stable_across_tier_moves() {
        let mut item = MemoryItem::new("u1", "likes tea", MemoryType::Preference, 0.5);
        let id = item.memory_id();
        item.tier = MemoryTier::Cold;
        assert_eq!(item.memory_id(), id);
        assert!(id.starts_with("u1_"));
    }

    #[test]
    fn importance_is_clamped() {
        assert_eq!(
            MemoryItem::new("u", "x", MemoryType::Conversation, 1.7).importance,
            1.0
        );
        assert_eq!(
            MemoryItem::new("u", "x", MemoryType::Conversation, -0.2).importance,
            0.0
        );
    }

    #[test]
    fn meta_value_untagged_round_trip() {
        let mut meta = Metadata::new();
        meta.insert("tags".into(), MetaValue::List(vec!["a".into(), "b".into()]));
        meta.insert("score".into(), MetaValue::Float(0.25));
        meta.insert("seen".into(), MetaValue::Bool(true));

        let json = serde_json::to_string(&meta).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn pending_interaction_has_no_final_bubbles() {
        let i = Interaction::pending("u1", "hi", "raw", vec!["hey".into()]);
        assert_eq!(i.review_status, ReviewStatus::Pending);
        assert!(i.final_bubbles.is_none());
        assert!(!i.delivery_hold);
    }

    #[test]
    fn protocol_status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&ProtocolStatus::Active).unwrap(),
            "\"ACTIVE\""
        );
    }
}
