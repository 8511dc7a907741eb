use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::machine::{
    validate_approve, validate_claim, validate_deliver, validate_reject, ApproveRequest, Outcome,
};
use gr_core::types::{Interaction, ReviewStatus, RiskRecommendation};
use gr_core::{Error, Result};
use gr_stores::{Database, StoreError};

// ---------------------------------------------------------------------------
// ReviewStore trait
// ---------------------------------------------------------------------------

/// Persistence and transitions for [`Interaction`]s. All transitions are
/// single transactions, idempotent under retry of the same
/// (operation, interaction, reviewer) tuple.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Persist a freshly generated interaction in `pending`.
    async fn stage(&self, interaction: &Interaction) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Option<Interaction>>;

    /// pending → in_review. Enforces at most one in-review interaction per
    /// user.
    async fn claim(&self, id: Uuid, reviewer_id: &str) -> Result<Interaction>;

    /// in_review (by caller) → approved.
    async fn approve(
        &self,
        id: Uuid,
        reviewer_id: &str,
        request: ApproveRequest,
    ) -> Result<Interaction>;

    /// in_review (by caller) → rejected.
    async fn reject(
        &self,
        id: Uuid,
        reviewer_id: &str,
        notes: Option<String>,
    ) -> Result<Interaction>;

    /// approved → delivered.
    async fn mark_delivered(&self, id: Uuid) -> Result<Interaction>;

    /// The reviewer queue: pending rows ordered by priority then age.
    async fn list_pending(&self, limit: usize, min_priority: f64) -> Result<Vec<Interaction>>;

    /// Recovery: in_review rows started before `older_than` go back to
    /// pending. Returns the affected ids.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Recovery: approved rows decided before `decided_before` and never
    /// delivered (and not held).
    async fn approved_undelivered(
        &self,
        decided_before: DateTime<Utc>,
    ) -> Result<Vec<Interaction>>;

    /// Cancellation: tag a user's undelivered interactions for
    /// non-delivery. Rows stay in place for audit.
    async fn hold_user_deliveries(&self, user_id: &str) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// PgReviewStore
// ---------------------------------------------------------------------------

const INTERACTION_COLUMNS: &str = "id, user_id, user_message, raw_generation, refined_bubbles, \
     risk_score, risk_flags, risk_recommendation, priority_score, review_status, reviewer_id, \
     edit_tags, final_bubbles, quality_score, reviewer_notes, delivery_hold, created_at, \
     review_started_at, decided_at, delivered_at";

pub struct PgReviewStore {
    db: Database,
}

impl PgReviewStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_interaction(row: &sqlx::postgres::PgRow) -> Result<Interaction> {
        let status: String = row.try_get("review_status").map_err(store_err)?;
        let recommendation: String = row.try_get("risk_recommendation").map_err(store_err)?;
        let refined: serde_json::Value = row.try_get("refined_bubbles").map_err(store_err)?;
        let flags: serde_json::Value = row.try_get("risk_flags").map_err(store_err)?;
        let tags: serde_json::Value = row.try_get("edit_tags").map_err(store_err)?;
        let final_bubbles: Option<serde_json::Value> =
            row.try_get("final_bubbles").map_err(store_err)?;

        Ok(Interaction {
            id: row.try_get("id").map_err(store_err)?,
            user_id: row.try_get("user_id").map_err(store_err)?,
            user_message: row.try_get("user_message").map_err(store_err)?,
            raw_generation: row.try_get("raw_generation").map_err(store_err)?,
            refined_bubbles: serde_json::from_value(refined).unwrap_or_default(),
            risk_score: row.try_get("risk_score").map_err(store_err)?,
            risk_flags: serde_json::from_value(flags).unwrap_or_default(),
            risk_recommendation: parse_recommendation(&recommendation),
            priority_score: row.try_get("priority_score").map_err(store_err)?,
            review_status: parse_status(&status),
            reviewer_id: row.try_get("reviewer_id").map_err(store_err)?,
            edit_tags: serde_json::from_value(tags).unwrap_or_default(),
            final_bubbles: final_bubbles.and_then(|v| serde_json::from_value(v).ok()),
            quality_score: row.try_get("quality_score").map_err(store_err)?,
            reviewer_notes: row.try_get("reviewer_notes").map_err(store_err)?,
            delivery_hold: row.try_get("delivery_hold").map_err(store_err)?,
            created_at: row.try_get("created_at").map_err(store_err)?,
            review_started_at: row.try_get("review_started_at").map_err(store_err)?,
            decided_at: row.try_get("decided_at").map_err(store_err)?,
            delivered_at: row.try_get("delivered_at").map_err(store_err)?,
        })
    }

    async fn locked_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: Uuid,
    ) -> Result<Interaction> {
        let row = sqlx::query(&format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => Self::row_to_interaction(&row),
            None => Err(Error::Conflict(format!("interaction {id} not found"))),
        }
    }
}

fn store_err(e: sqlx::Error) -> Error {
    StoreError::from(e).into()
}

fn parse_status(s: &str) -> ReviewStatus {
    match s {
        "in_review" => ReviewStatus::InReview,
        "approved" => ReviewStatus::Approved,
        "rejected" => ReviewStatus::Rejected,
        "delivered" => ReviewStatus::Delivered,
        _ => ReviewStatus::Pending,
    }
}

fn parse_recommendation(s: &str) -> RiskRecommendation {
    match s {
        "approve" => RiskRecommendation::Approve,
        "reject" => RiskRecommendation::Reject,
        _ => RiskRecommendation::Review,
    }
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn stage(&self, interaction: &Interaction) -> Result<Uuid> {
        let refined = serde_json::to_value(&interaction.refined_bubbles)?;
        let flags = serde_json::to_value(&interaction.risk_flags)?;
        let tags = serde_json::to_value(&interaction.edit_tags)?;
        let final_bubbles = interaction
            .final_bubbles
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO interactions
                   (id, user_id, user_message, raw_generation, refined_bubbles,
                    risk_score, risk_flags, risk_recommendation, priority_score,
                    review_status, reviewer_id, edit_tags, final_bubbles,
                    quality_score, reviewer_notes, delivery_hold, created_at,
                    decided_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                       $14, $15, $16, $17, $18)"#,
        )
        .bind(interaction.id)
        .bind(&interaction.user_id)
        .bind(&interaction.user_message)
        .bind(&interaction.raw_generation)
        .bind(refined)
        .bind(interaction.risk_score)
        .bind(flags)
        .bind(match interaction.risk_recommendation {
            RiskRecommendation::Approve => "approve",
            RiskRecommendation::Review => "review",
            RiskRecommendation::Reject => "reject",
        })
        .bind(interaction.priority_score)
        .bind(interaction.review_status.as_str())
        .bind(&interaction.reviewer_id)
        .bind(tags)
        .bind(final_bubbles)
        .bind(interaction.quality_score)
        .bind(&interaction.reviewer_notes)
        .bind(interaction.delivery_hold)
        .bind(interaction.created_at)
        .bind(interaction.decided_at)
        .execute(self.db.pool())
        .await
        .map_err(store_err)?;

        debug!(interaction_id = %interaction.id, user_id = %interaction.user_id, "interaction staged");
        Ok(interaction.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Interaction>> {
        let row = sqlx::query(&format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(store_err)?;
        row.as_ref().map(Self::row_to_interaction).transpose()
    }

    async fn claim(&self, id: Uuid, reviewer_id: &str) -> Result<Interaction> {
        let mut tx = self.db.pool().begin().await.map_err(store_err)?;
        let interaction = Self::locked_row(&mut tx, id).await?;

        match validate_claim(&interaction, reviewer_id)? {
            Outcome::NoOp => {
                tx.commit().await.map_err(store_err)?;
                return Ok(interaction);
            }
            Outcome::Apply => {}
        }

        // Per-user serialization: at most one in-review row per user. The
        // partial unique index backs this up at the constraint level.
        let other: Option<sqlx::postgres::PgRow> = sqlx::query(
            r#"SELECT id FROM interactions
               WHERE user_id = $1 AND review_status = 'in_review' AND id <> $2
               FOR UPDATE"#,
        )
        .bind(&interaction.user_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        if other.is_some() {
            return Err(Error::Conflict(format!(
                "user {} already has an interaction in review",
                interaction.user_id
            )));
        }

        let row = sqlx::query(&format!(
            r#"UPDATE interactions
               SET review_status = 'in_review', reviewer_id = $2, review_started_at = NOW()
               WHERE id = $1
               RETURNING {INTERACTION_COLUMNS}"#
        ))
        .bind(id)
        .bind(reviewer_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        let updated = Self::row_to_interaction(&row)?;
        info!(interaction_id = %id, reviewer_id, "interaction claimed");
        Ok(updated)
    }

    async fn approve(
        &self,
        id: Uuid,
        reviewer_id: &str,
        request: ApproveRequest,
    ) -> Result<Interaction> {
        let mut tx = self.db.pool().begin().await.map_err(store_err)?;
        let interaction = Self::locked_row(&mut tx, id).await?;

        match validate_approve(&interaction, reviewer_id, &request)? {
            Outcome::NoOp => {
                tx.commit().await.map_err(store_err)?;
                return Ok(interaction);
            }
            Outcome::Apply => {}
        }

        let final_bubbles = serde_json::to_value(&request.final_bubbles)?;
        let edit_tags = serde_json::to_value(&request.edit_tags)?;

        let row = sqlx::query(&format!(
            r#"UPDATE interactions
               SET review_status = 'approved', final_bubbles = $2, edit_tags = $3,
                   quality_score = $4, reviewer_notes = $5, decided_at = NOW()
               WHERE id = $1
               RETURNING {INTERACTION_COLUMNS}"#
        ))
        .bind(id)
        .bind(&final_bubbles)
        .bind(&edit_tags)
        .bind(request.quality_score)
        .bind(&request.reviewer_notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"INSERT INTO human_edits (interaction_id, reviewer_id, edit_tags, quality_score, notes)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(id)
        .bind(reviewer_id)
        .bind(&edit_tags)
        .bind(request.quality_score)
        .bind(&request.reviewer_notes)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        let updated = Self::row_to_interaction(&row)?;
        info!(interaction_id = %id, reviewer_id, "interaction approved");
        Ok(updated)
    }

    async fn reject(
        &self,
        id: Uuid,
        reviewer_id: &str,
        notes: Option<String>,
    ) -> Result<Interaction> {
        let mut tx = self.db.pool().begin().await.map_err(store_err)?;
        let interaction = Self::locked_row(&mut tx, id).await?;

        match validate_reject(&interaction, reviewer_id)? {
            Outcome::NoOp => {
                tx.commit().await.map_err(store_err)?;
                return Ok(interaction);
            }
            Outcome::Apply => {}
        }

        let row = sqlx::query(&format!(
            r#"UPDATE interactions
               SET review_status = 'rejected', reviewer_notes = $2, decided_at = NOW()
               WHERE id = $1
               RETURNING {INTERACTION_COLUMNS}"#
        ))
        .bind(id)
        .bind(&notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        let updated = Self::row_to_interaction(&row)?;
        info!(interaction_id = %id, reviewer_id, "interaction rejected");
        Ok(updated)
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<Interaction> {
        let mut tx = self.db.pool().begin().await.map_err(store_err)?;
        let interaction = Self::locked_row(&mut tx, id).await?;

        match validate_deliver(&interaction)? {
            Outcome::NoOp => {
                tx.commit().await.map_err(store_err)?;
                return Ok(interaction);
            }
            Outcome::Apply => {}
        }

        let row = sqlx::query(&format!(
            r#"UPDATE interactions
               SET review_status = 'delivered', delivered_at = NOW()
               WHERE id = $1
               RETURNING {INTERACTION_COLUMNS}"#
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Self::row_to_interaction(&row)
    }

    async fn list_pending(&self, limit: usize, min_priority: f64) -> Result<Vec<Interaction>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {INTERACTION_COLUMNS} FROM interactions
               WHERE review_status = 'pending'
                 AND delivery_hold = FALSE
                 AND priority_score >= $1
               ORDER BY priority_score DESC, created_at ASC
               LIMIT $2"#
        ))
        .bind(min_priority)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::row_to_interaction).collect()
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"UPDATE interactions
               SET review_status = 'pending', reviewer_id = NULL, review_started_at = NULL
               WHERE review_status = 'in_review' AND review_started_at < $1
               RETURNING id"#,
        )
        .bind(older_than)
        .fetch_all(self.db.pool())
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|r| r.try_get("id").map_err(store_err))
            .collect()
    }

    async fn approved_undelivered(
        &self,
        decided_before: DateTime<Utc>,
    ) -> Result<Vec<Interaction>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {INTERACTION_COLUMNS} FROM interactions
               WHERE review_status = 'approved'
                 AND delivered_at IS NULL
                 AND delivery_hold = FALSE
                 AND decided_at < $1
               ORDER BY decided_at ASC"#
        ))
        .bind(decided_before)
        .fetch_all(self.db.pool())
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::row_to_interaction).collect()
    }

    async fn hold_user_deliveries(&self, user_id: &str) -> Result<usize> {
        let result = sqlx::query(
            r#"UPDATE interactions
               SET delivery_hold = TRUE
               WHERE user_id = $1
                 AND review_status IN ('pending', 'in_review', 'approved')"#,
        )
        .bind(user_id)
        .execute(self.db.pool())
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() as usize)
    }
}

// ---------------------------------------------------------------------------
// InMemoryReviewStore
// ---------------------------------------------------------------------------

/// Mutex-guarded [`ReviewStore`] applying the same transition rules, for
/// tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    rows: Mutex<HashMap<Uuid, Interaction>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row, unordered. Test and diagnostics helper.
    pub fn snapshot(&self) -> Vec<Interaction> {
        let rows = self.rows.lock().expect("review rows lock");
        rows.values().cloned().collect()
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn stage(&self, interaction: &Interaction) -> Result<Uuid> {
        let mut rows = self.rows.lock().expect("review rows lock");
        rows.insert(interaction.id, interaction.clone());
        Ok(interaction.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Interaction>> {
        let rows = self.rows.lock().expect("review rows lock");
        Ok(rows.get(&id).cloned())
    }

    async fn claim(&self, id: Uuid, reviewer_id: &str) -> Result<Interaction> {
        let mut rows = self.rows.lock().expect("review rows lock");
        let interaction = rows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Conflict(format!("interaction {id} not found")))?;

        match validate_claim(&interaction, reviewer_id)? {
            Outcome::NoOp => return Ok(interaction),
            Outcome::Apply => {}
        }

        let user_busy = rows.values().any(|i| {
            i.user_id == interaction.user_id
                && i.review_status == ReviewStatus::InReview
                && i.id != id
        });
        if user_busy {
            return Err(Error::Conflict(format!(
                "user {} already has an interaction in review",
                interaction.user_id
            )));
        }

        let row = rows.get_mut(&id).expect("row exists");
        row.review_status = ReviewStatus::InReview;
        row.reviewer_id = Some(reviewer_id.to_string());
        row.review_started_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn approve(
        &self,
        id: Uuid,
        reviewer_id: &str,
        request: ApproveRequest,
    ) -> Result<Interaction> {
        let mut rows = self.rows.lock().expect("review rows lock");
        let interaction = rows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Conflict(format!("interaction {id} not found")))?;

        match validate_approve(&interaction, reviewer_id, &request)? {
            Outcome::NoOp => return Ok(interaction),
            Outcome::Apply => {}
        }

        let row = rows.get_mut(&id).expect("row exists");
        row.review_status = ReviewStatus::Approved;
        row.final_bubbles = Some(request.final_bubbles);
        row.edit_tags = request.edit_tags;
        row.quality_score = request.quality_score;
        row.reviewer_notes = request.reviewer_notes;
        row.decided_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn reject(
        &self,
        id: Uuid,
        reviewer_id: &str,
        notes: Option<String>,
    ) -> Result<Interaction> {
        let mut rows = self.rows.lock().expect("review rows lock");
        let interaction = rows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Conflict(format!("interaction {id} not found")))?;

        match validate_reject(&interaction, reviewer_id)? {
            Outcome::NoOp => return Ok(interaction),
            Outcome::Apply => {}
        }

        let row = rows.get_mut(&id).expect("row exists");
        row.review_status = ReviewStatus::Rejected;
        row.reviewer_notes = notes;
        row.decided_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<Interaction> {
        let mut rows = self.rows.lock().expect("review rows lock");
        let interaction = rows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Conflict(format!("interaction {id} not found")))?;

        match validate_deliver(&interaction)? {
            Outcome::NoOp => return Ok(interaction),
            Outcome::Apply => {}
        }

        let row = rows.get_mut(&id).expect("row exists");
        row.review_status = ReviewStatus::Delivered;
        row.delivered_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn list_pending(&self, limit: usize, min_priority: f64) -> Result<Vec<Interaction>> {
        let rows = self.rows.lock().expect("review rows lock");
        let mut pending: Vec<Interaction> = rows
            .values()
            .filter(|i| {
                i.review_status == ReviewStatus::Pending
                    && !i.delivery_hold
                    && i.priority_score >= min_priority
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut rows = self.rows.lock().expect("review rows lock");
        let mut reclaimed = Vec::new();
        for row in rows.values_mut() {
            if row.review_status == ReviewStatus::InReview
                && row.review_started_at.is_some_and(|t| t < older_than)
            {
                row.review_status = ReviewStatus::Pending;
                row.reviewer_id = None;
                row.review_started_at = None;
                reclaimed.push(row.id);
            }
        }
        Ok(reclaimed)
    }

    async fn approved_undelivered(
        &self,
        decided_before: DateTime<Utc>,
    ) -> Result<Vec<Interaction>> {
        let rows = self.rows.lock().expect("review rows lock");
        let mut out: Vec<Interaction> = rows
            .values()
            .filter(|i| {
                i.review_status == ReviewStatus::Approved
                    && i.delivered_at.is_none()
                    && !i.delivery_hold
                    && i.decided_at.is_some_and(|t| t < decided_before)
            })
            .cloned()
            .collect();
        out.sort_by_key(|i| i.decided_at);
        Ok(out)
    }

    async fn hold_user_deliveries(&self, user_id: &str) -> Result<usize> {
        let mut rows = self.rows.lock().expect("review rows lock");
        let mut held = 0;
        for row in rows.values_mut() {
            if row.user_id == user_id
                && matches!(
                    row.review_status,
                    ReviewStatus::Pending | ReviewStatus::InReview | ReviewStatus::Approved
                )
            {
                row.delivery_hold = true;
                held += 1;
            }
        }
        Ok(held)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(user: &str, priority: f64) -> Interaction {
        let mut i = Interaction::pending(user, "hi", "raw", vec!["hey".into(), "there".into()]);
        i.priority_score = priority;
        i
    }

    fn approve_req(bubbles: &[&str]) -> ApproveRequest {
        ApproveRequest {
            final_bubbles: bubbles.iter().map(|s| s.to_string()).collect(),
            edit_tags: vec![],
            quality_score: Some(4),
            reviewer_notes: None,
        }
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let store = InMemoryReviewStore::new();
        let i = staged("u1", 0.5);
        let id = store.stage(&i).await.unwrap();

        let claimed = store.claim(id, "rev_a").await.unwrap();
        assert_eq!(claimed.review_status, ReviewStatus::InReview);
        assert!(claimed.review_started_at.is_some());

        let approved = store
            .approve(id, "rev_a", approve_req(&["hi", "how are you"]))
            .await
            .unwrap();
        assert_eq!(approved.review_status, ReviewStatus::Approved);
        assert_eq!(
            approved.final_bubbles.as_deref(),
            Some(&["hi".to_string(), "how are you".to_string()][..])
        );
        assert!(approved.decided_at.is_some());

        let delivered = store.mark_delivered(id).await.unwrap();
        assert_eq!(delivered.review_status, ReviewStatus::Delivered);
        assert!(delivered.delivered_at.is_some());
    }

    #[tokio::test]
    async fn concurrent_claim_conflicts() {
        let store = InMemoryReviewStore::new();
        let id = store.stage(&staged("u1", 0.5)).await.unwrap();

        store.claim(id, "rev_a").await.unwrap();
        let err = store.claim(id, "rev_b").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // The original claimer can still approve.
        store
            .approve(id, "rev_a", approve_req(&["ok"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn one_in_review_per_user() {
        let store = InMemoryReviewStore::new();
        let first = store.stage(&staged("u1", 0.5)).await.unwrap();
        let second = store.stage(&staged("u1", 0.5)).await.unwrap();

        store.claim(first, "rev_a").await.unwrap();
        let err = store.claim(second, "rev_b").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // After the first resolves, the second becomes claimable.
        store
            .approve(first, "rev_a", approve_req(&["ok"]))
            .await
            .unwrap();
        store.claim(second, "rev_b").await.unwrap();
    }

    #[tokio::test]
    async fn transitions_are_idempotent() {
        let store = InMemoryReviewStore::new();
        let id = store.stage(&staged("u1", 0.5)).await.unwrap();

        store.claim(id, "rev_a").await.unwrap();
        let again = store.claim(id, "rev_a").await.unwrap();
        assert_eq!(again.review_status, ReviewStatus::InReview);

        store
            .approve(id, "rev_a", approve_req(&["ok"]))
            .await
            .unwrap();
        let again = store
            .approve(id, "rev_a", approve_req(&["ok"]))
            .await
            .unwrap();
        assert_eq!(again.review_status, ReviewStatus::Approved);

        store.mark_delivered(id).await.unwrap();
        let again = store.mark_delivered(id).await.unwrap();
        assert_eq!(again.review_status, ReviewStatus::Delivered);
    }

    #[tokio::test]
    async fn rejected_rows_keep_null_bubbles() {
        let store = InMemoryReviewStore::new();
        let id = store.stage(&staged("u1", 0.5)).await.unwrap();
        store.claim(id, "rev_a").await.unwrap();

        let rejected = store
            .reject(id, "rev_a", Some("off-brand".into()))
            .await
            .unwrap();
        assert_eq!(rejected.review_status, ReviewStatus::Rejected);
        assert!(rejected.final_bubbles.is_none());
        assert_eq!(rejected.reviewer_notes.as_deref(), Some("off-brand"));
    }

    #[tokio::test]
    async fn pending_queue_orders_by_priority_then_age() {
        let store = InMemoryReviewStore::new();

        let mut low = staged("u1", 0.2);
        low.created_at = Utc::now() - chrono::Duration::minutes(10);
        let mut high_old = staged("u2", 0.9);
        high_old.created_at = Utc::now() - chrono::Duration::minutes(5);
        let mut high_new = staged("u3", 0.9);
        high_new.created_at = Utc::now();

        store.stage(&low).await.unwrap();
        store.stage(&high_old).await.unwrap();
        store.stage(&high_new).await.unwrap();

        let queue = store.list_pending(10, 0.0).await.unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue[0].id, high_old.id);
        assert_eq!(queue[1].id, high_new.id);
        assert_eq!(queue[2].id, low.id);

        let filtered = store.list_pending(10, 0.5).await.unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[tokio::test]
    async fn stale_in_review_is_reclaimed() {
        let store = InMemoryReviewStore::new();
        let id = store.stage(&staged("u1", 0.5)).await.unwrap();
        store.claim(id, "rev_a").await.unwrap();

        // Nothing stale yet.
        let reclaimed = store
            .reclaim_stale(Utc::now() - chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        let reclaimed = store
            .reclaim_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![id]);

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.review_status, ReviewStatus::Pending);
        assert!(row.reviewer_id.is_none());
    }

    #[tokio::test]
    async fn approved_undelivered_surfaces_for_recovery() {
        let store = InMemoryReviewStore::new();
        let id = store.stage(&staged("u1", 0.5)).await.unwrap();
        store.claim(id, "rev_a").await.unwrap();
        store
            .approve(id, "rev_a", approve_req(&["ok"]))
            .await
            .unwrap();

        let found = store
            .approved_undelivered(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        store.mark_delivered(id).await.unwrap();
        let found = store
            .approved_undelivered(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn held_rows_leave_queue_and_refuse_delivery() {
        let store = InMemoryReviewStore::new();
        let pending_id = store.stage(&staged("u1", 0.5)).await.unwrap();
        let approved_id = store.stage(&staged("u1", 0.5)).await.unwrap();
        store.claim(approved_id, "rev_a").await.unwrap();
        store
            .approve(approved_id, "rev_a", approve_req(&["ok"]))
            .await
            .unwrap();

        let held = store.hold_user_deliveries("u1").await.unwrap();
        assert_eq!(held, 2);

        assert!(store.list_pending(10, 0.0).await.unwrap().is_empty());
        let err = store.mark_delivered(approved_id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Rows remain for audit.
        assert!(store.get(pending_id).await.unwrap().is_some());
    }
}
