use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sqlx::Row;
use uuid::Uuid;

use gr_core::types::{AuditAction, AuditEntry, ProtocolState, ProtocolStatus, QuarantineMessage};
use gr_stores::error::{Result, StoreError};
use gr_stores::Database;

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

/// Raw aggregates the stats endpoint is built from.
#[derive(Debug, Clone, Default)]
pub struct QuarantineTotals {
    pub active_users: i64,
    pub total_messages_quarantined: i64,
    pub total_cost_saved: f64,
    pub pending_messages: i64,
    pub messages_24h: i64,
    pub cost_saved_24h: f64,
}

// ---------------------------------------------------------------------------
// ProtocolStore trait
// ---------------------------------------------------------------------------

/// Persistence for protocol state, quarantine rows, and the audit log.
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    async fn get_state(&self, user_id: &str) -> Result<Option<ProtocolState>>;
    async fn upsert_state(&self, state: &ProtocolState) -> Result<()>;

    /// Insert a quarantine row and bump the user's counters in one step.
    async fn quarantine_insert(&self, message: &QuarantineMessage, cost: f64) -> Result<()>;

    async fn get_message(&self, id: Uuid) -> Result<Option<QuarantineMessage>>;
    async fn list_messages(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QuarantineMessage>>;
    async fn mark_processed(&self, ids: &[Uuid], by: &str, at: DateTime<Utc>) -> Result<usize>;
    async fn delete_messages(&self, ids: &[Uuid]) -> Result<usize>;
    /// Remove unprocessed rows past their expiry.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
    async fn list_audit(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<AuditEntry>>;

    async fn totals(&self, now: DateTime<Utc>) -> Result<QuarantineTotals>;
}

// ---------------------------------------------------------------------------
// PgProtocolStore
// ---------------------------------------------------------------------------

pub struct PgProtocolStore {
    db: Database,
}

impl PgProtocolStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_state(row: &sqlx::postgres::PgRow) -> Result<ProtocolState> {
        let status: String = row.try_get("status").map_err(StoreError::from)?;
        Ok(ProtocolState {
            user_id: row.try_get("user_id").map_err(StoreError::from)?,
            status: parse_status(&status),
            activated_by: row.try_get("activated_by").map_err(StoreError::from)?,
            activated_at: row.try_get("activated_at").map_err(StoreError::from)?,
            reason: row.try_get("reason").map_err(StoreError::from)?,
            messages_quarantined: row
                .try_get("messages_quarantined")
                .map_err(StoreError::from)?,
            cost_saved: row.try_get("cost_saved").map_err(StoreError::from)?,
            last_message_at: row.try_get("last_message_at").map_err(StoreError::from)?,
            updated_at: row.try_get("updated_at").map_err(StoreError::from)?,
        })
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<QuarantineMessage> {
        Ok(QuarantineMessage {
            id: row.try_get("id").map_err(StoreError::from)?,
            user_id: row.try_get("user_id").map_err(StoreError::from)?,
            text: row.try_get("message_text").map_err(StoreError::from)?,
            external_message_id: row
                .try_get("external_message_id")
                .map_err(StoreError::from)?,
            received_at: row.try_get("received_at").map_err(StoreError::from)?,
            expires_at: row.try_get("expires_at").map_err(StoreError::from)?,
            processed: row.try_get("processed").map_err(StoreError::from)?,
            processed_at: row.try_get("processed_at").map_err(StoreError::from)?,
            processed_by: row.try_get("processed_by").map_err(StoreError::from)?,
        })
    }

    fn row_to_audit(row: &sqlx::postgres::PgRow) -> Result<AuditEntry> {
        let action: String = row.try_get("action").map_err(StoreError::from)?;
        let previous: String = row.try_get("previous_status").map_err(StoreError::from)?;
        let new: String = row.try_get("new_status").map_err(StoreError::from)?;
        Ok(AuditEntry {
            user_id: row.try_get("user_id").map_err(StoreError::from)?,
            action: parse_action(&action),
            performed_by: row.try_get("performed_by").map_err(StoreError::from)?,
            reason: row.try_get("reason").map_err(StoreError::from)?,
            previous_status: parse_status(&previous),
            new_status: parse_status(&new),
            created_at: row.try_get("created_at").map_err(StoreError::from)?,
        })
    }
}

fn parse_status(s: &str) -> ProtocolStatus {
    if s == "ACTIVE" {
        ProtocolStatus::Active
    } else {
        ProtocolStatus::Inactive
    }
}

fn parse_action(s: &str) -> AuditAction {
    match s {
        "ACTIVATE" => AuditAction::Activate,
        "DEACTIVATE" => AuditAction::Deactivate,
        _ => AuditAction::OneTimePass,
    }
}

const STATE_COLUMNS: &str = "user_id, status, activated_by, activated_at, reason, \
     messages_quarantined, cost_saved, last_message_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, user_id, message_text, external_message_id, received_at, \
     expires_at, processed, processed_at, processed_by";

#[async_trait]
impl ProtocolStore for PgProtocolStore {
    async fn get_state(&self, user_id: &str) -> Result<Option<ProtocolState>> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM user_protocol_status WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(StoreError::from)?;

        row.as_ref().map(Self::row_to_state).transpose()
    }

    async fn upsert_state(&self, state: &ProtocolState) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO user_protocol_status
                   (user_id, status, activated_by, activated_at, reason,
                    messages_quarantined, cost_saved, last_message_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
               ON CONFLICT (user_id) DO UPDATE SET
                   status = EXCLUDED.status,
                   activated_by = EXCLUDED.activated_by,
                   activated_at = EXCLUDED.activated_at,
                   reason = EXCLUDED.reason,
                   updated_at = NOW()"#,
        )
        .bind(&state.user_id)
        .bind(state.status.as_str())
        .bind(&state.activated_by)
        .bind(state.activated_at)
        .bind(&state.reason)
        .bind(state.messages_quarantined)
        .bind(state.cost_saved)
        .bind(state.last_message_at)
        .execute(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn quarantine_insert(&self, message: &QuarantineMessage, cost: f64) -> Result<()> {
        self.db
            .with_retries("quarantine_insert", || async {
                let mut tx = self.db.pool().begin().await.map_err(StoreError::from)?;

                sqlx::query(
                    r#"INSERT INTO quarantine_messages
                           (id, user_id, message_text, external_message_id,
                            received_at, expires_at, processed)
                       VALUES ($1, $2, $3, $4, $5, $6, FALSE)"#,
                )
                .bind(message.id)
                .bind(&message.user_id)
                .bind(&message.text)
                .bind(&message.external_message_id)
                .bind(message.received_at)
                .bind(message.expires_at)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;

                sqlx::query(
                    r#"UPDATE user_protocol_status SET
                           messages_quarantined = messages_quarantined + 1,
                           cost_saved = cost_saved + $2,
                           last_message_at = $3,
                           updated_at = NOW()
                       WHERE user_id = $1"#,
                )
                .bind(&message.user_id)
                .bind(cost)
                .bind(message.received_at)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;

                tx.commit().await.map_err(StoreError::from)?;
                Ok(())
            })
            .await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<QuarantineMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM quarantine_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn list_messages(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QuarantineMessage>> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM quarantine_messages
                     WHERE user_id = $1 AND processed = FALSE
                     ORDER BY received_at DESC LIMIT $2"
                ))
                .bind(uid)
                .bind(limit as i64)
                .fetch_all(self.db.pool())
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM quarantine_messages
                     WHERE processed = FALSE
                     ORDER BY received_at DESC LIMIT $1"
                ))
                .bind(limit as i64)
                .fetch_all(self.db.pool())
                .await
            }
        }
        .map_err(StoreError::from)?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn mark_processed(&self, ids: &[Uuid], by: &str, at: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            r#"UPDATE quarantine_messages
               SET processed = TRUE, processed_at = $2, processed_by = $3
               WHERE id = ANY($1) AND processed = FALSE"#,
        )
        .bind(ids)
        .bind(at)
        .bind(by)
        .execute(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_messages(&self, ids: &[Uuid]) -> Result<usize> {
        let result = sqlx::query("DELETE FROM quarantine_messages WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.db.pool())
            .await
            .map_err(StoreError::from)?;
        Ok(result.rows_affected() as usize)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM quarantine_messages WHERE expires_at < $1 AND processed = FALSE",
        )
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(result.rows_affected() as usize)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO protocol_audit_log
                   (user_id, action, performed_by, reason, previous_status, new_status, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(&entry.user_id)
        .bind(entry.action.as_str())
        .bind(&entry.performed_by)
        .bind(&entry.reason)
        .bind(entry.previous_status.as_str())
        .bind(entry.new_status.as_str())
        .bind(entry.created_at)
        .execute(self.db.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn list_audit(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<AuditEntry>> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query(
                    r#"SELECT user_id, action, performed_by, reason,
                              previous_status, new_status, created_at
                       FROM protocol_audit_log WHERE user_id = $1
                       ORDER BY created_at DESC LIMIT $2"#,
                )
                .bind(uid)
                .bind(limit as i64)
                .fetch_all(self.db.pool())
                .await
            }
            None => {
                sqlx::query(
                    r#"SELECT user_id, action, performed_by, reason,
                              previous_status, new_status, created_at
                       FROM protocol_audit_log
                       ORDER BY created_at DESC LIMIT $1"#,
                )
                .bind(limit as i64)
                .fetch_all(self.db.pool())
                .await
            }
        }
        .map_err(StoreError::from)?;

        rows.iter().map(Self::row_to_audit).collect()
    }

    async fn totals(&self, now: DateTime<Utc>) -> Result<QuarantineTotals> {
        let cutoff = now - ChronoDuration::hours(24);

        let row = sqlx::query(
            r#"SELECT
                   (SELECT COUNT(*) FROM user_protocol_status WHERE status = 'ACTIVE')
                       AS active_users,
                   (SELECT COALESCE(SUM(messages_quarantined), 0) FROM user_protocol_status)
                       AS total_messages,
                   (SELECT COALESCE(SUM(cost_saved), 0) FROM user_protocol_status)
                       AS total_cost,
                   (SELECT COUNT(*) FROM quarantine_messages WHERE processed = FALSE)
                       AS pending_messages,
                   (SELECT COUNT(*) FROM quarantine_messages WHERE received_at >= $1)
                       AS messages_24h"#,
        )
        .bind(cutoff)
        .fetch_one(self.db.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(QuarantineTotals {
            active_users: row.try_get("active_users").map_err(StoreError::from)?,
            total_messages_quarantined: row.try_get("total_messages").map_err(StoreError::from)?,
            total_cost_saved: row.try_get("total_cost").map_err(StoreError::from)?,
            pending_messages: row.try_get("pending_messages").map_err(StoreError::from)?,
            messages_24h: row.try_get("messages_24h").map_err(StoreError::from)?,
            cost_saved_24h: 0.0, // derived by the manager from messages_24h
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryProtocolStore
// ---------------------------------------------------------------------------

/// Dashmap-backed [`ProtocolStore`] used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryProtocolStore {
    states: DashMap<String, ProtocolState>,
    messages: DashMap<Uuid, QuarantineMessage>,
    audit: std::sync::Mutex<Vec<AuditEntry>>,
}

impl InMemoryProtocolStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtocolStore for InMemoryProtocolStore {
    async fn get_state(&self, user_id: &str) -> Result<Option<ProtocolState>> {
        Ok(self.states.get(user_id).map(|s| s.clone()))
    }

    async fn upsert_state(&self, state: &ProtocolState) -> Result<()> {
        self.states
            .entry(state.user_id.clone())
            .and_modify(|existing| {
                existing.status = state.status;
                existing.activated_by = state.activated_by.clone();
                existing.activated_at = state.activated_at;
                existing.reason = state.reason.clone();
                existing.updated_at = Utc::now();
            })
            .or_insert_with(|| state.clone());
        Ok(())
    }

    async fn quarantine_insert(&self, message: &QuarantineMessage, cost: f64) -> Result<()> {
        self.messages.insert(message.id, message.clone());
        if let Some(mut state) = self.states.get_mut(&message.user_id) {
            state.messages_quarantined += 1;
            state.cost_saved += cost;
            state.last_message_at = Some(message.received_at);
            state.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<QuarantineMessage>> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn list_messages(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QuarantineMessage>> {
        let mut out: Vec<QuarantineMessage> = self
            .messages
            .iter()
            .filter(|e| !e.value().processed)
            .filter(|e| user_id.is_none_or(|uid| e.value().user_id == uid))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn mark_processed(&self, ids: &[Uuid], by: &str, at: DateTime<Utc>) -> Result<usize> {
        let mut count = 0;
        for id in ids {
            if let Some(mut msg) = self.messages.get_mut(id) {
                if !msg.processed {
                    msg.processed = true;
                    msg.processed_at = Some(at);
                    msg.processed_by = Some(by.to_string());
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn delete_messages(&self, ids: &[Uuid]) -> Result<usize> {
        let mut count = 0;
        for id in ids {
            if self.messages.remove(id).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Uuid> = self
            .messages
            .iter()
            .filter(|e| !e.value().processed && e.value().expires_at < now)
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            self.messages.remove(id);
        }
        Ok(expired.len())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.audit.lock().expect("audit lock").push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<AuditEntry>> {
        let audit = self.audit.lock().expect("audit lock");
        let mut out: Vec<AuditEntry> = audit
            .iter()
            .filter(|e| user_id.is_none_or(|uid| e.user_id == uid))
            .cloned()
            .collect();
        out.reverse();
        out.truncate(limit);
        Ok(out)
    }

    async fn totals(&self, now: DateTime<Utc>) -> Result<QuarantineTotals> {
        let cutoff = now - ChronoDuration::hours(24);
        let active_users = self
            .states
            .iter()
            .filter(|e| e.value().status == ProtocolStatus::Active)
            .count() as i64;
        let total_messages_quarantined: i64 = self
            .states
            .iter()
            .map(|e| e.value().messages_quarantined)
            .sum();
        let total_cost_saved: f64 = self.states.iter().map(|e| e.value().cost_saved).sum();
        let pending_messages = self
            .messages
            .iter()
            .filter(|e| !e.value().processed)
            .count() as i64;
        let messages_24h = self
            .messages
            .iter()
            .filter(|e| e.value().received_at >= cutoff)
            .count() as i64;

        Ok(QuarantineTotals {
            active_users,
            total_messages_quarantined,
            total_cost_saved,
            pending_messages,
            messages_24h,
            cost_saved_24h: 0.0,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message(user: &str, text: &str) -> QuarantineMessage {
        let now = Utc::now();
        QuarantineMessage {
            id: Uuid::new_v4(),
            user_id: user.into(),
            text: text.into(),
            external_message_id: None,
            received_at: now,
            expires_at: now + ChronoDuration::days(7),
            processed: false,
            processed_at: None,
            processed_by: None,
        }
    }

    #[tokio::test]
    async fn quarantine_insert_bumps_counters() {
        let store = InMemoryProtocolStore::new();
        let mut state = ProtocolState::inactive("u1");
        state.status = ProtocolStatus::Active;
        store.upsert_state(&state).await.unwrap();

        store.quarantine_insert(&message("u1", "hey"), 0.000307).await.unwrap();
        store.quarantine_insert(&message("u1", "hey again"), 0.000307).await.unwrap();

        let state = store.get_state("u1").await.unwrap().unwrap();
        assert_eq!(state.messages_quarantined, 2);
        assert!((state.cost_saved - 0.000614).abs() < 1e-9);
        assert!(state.last_message_at.is_some());
    }

    #[tokio::test]
    async fn processed_messages_leave_pending_listing() {
        let store = InMemoryProtocolStore::new();
        let msg = message("u1", "hello");
        let id = msg.id;
        store.quarantine_insert(&msg, 0.0).await.unwrap();

        assert_eq!(store.list_messages(Some("u1"), 10).await.unwrap().len(), 1);

        let n = store.mark_processed(&[id], "reviewer1", Utc::now()).await.unwrap();
        assert_eq!(n, 1);
        assert!(store.list_messages(Some("u1"), 10).await.unwrap().is_empty());

        // Re-processing is a no-op.
        let n = store.mark_processed(&[id], "reviewer2", Utc::now()).await.unwrap();
        assert_eq!(n, 0);
        let msg = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(msg.processed_by.as_deref(), Some("reviewer1"));
    }

    #[tokio::test]
    async fn purge_removes_only_expired_unprocessed() {
        let store = InMemoryProtocolStore::new();

        let mut expired = message("u1", "old");
        expired.expires_at = Utc::now() - ChronoDuration::hours(1);
        let mut expired_processed = message("u1", "old but handled");
        expired_processed.expires_at = Utc::now() - ChronoDuration::hours(1);
        expired_processed.processed = true;
        let fresh = message("u1", "new");

        store.quarantine_insert(&expired, 0.0).await.unwrap();
        store.quarantine_insert(&expired_processed, 0.0).await.unwrap();
        store.quarantine_insert(&fresh, 0.0).await.unwrap();

        let purged = store.purge_expired(Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_message(expired.id).await.unwrap().is_none());
        assert!(store.get_message(expired_processed.id).await.unwrap().is_some());
        assert!(store.get_message(fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn totals_count_active_users_and_windows() {
        let store = InMemoryProtocolStore::new();
        let mut active = ProtocolState::inactive("u1");
        active.status = ProtocolStatus::Active;
        store.upsert_state(&active).await.unwrap();
        store.upsert_state(&ProtocolState::inactive("u2")).await.unwrap();

        store.quarantine_insert(&message("u1", "x"), 0.000307).await.unwrap();

        let totals = store.totals(Utc::now()).await.unwrap();
        assert_eq!(totals.active_users, 1);
        assert_eq!(totals.total_messages_quarantined, 1);
        assert_eq!(totals.messages_24h, 1);
        assert_eq!(totals.pending_messages, 1);
    }
}
