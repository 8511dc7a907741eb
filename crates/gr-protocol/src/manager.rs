use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::ProtocolStore;
use gr_core::config::ProtocolConfig;
use gr_core::types::{
    AuditAction, AuditEntry, InboundMessage, ProtocolState, ProtocolStatus, QuarantineMessage,
};
use gr_core::{Error, Result};

/// Batch endpoints refuse anything larger than this.
pub const MAX_BATCH: usize = 100;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of the per-message admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divert {
    /// Protocol inactive (or a one-time pass was consumed): process normally.
    PassThrough,
    /// Message parked in quarantine; the pipeline must not touch it.
    Diverted { message_id: Uuid },
}

/// Stats payload served by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolStats {
    pub active_users: i64,
    pub total_messages_quarantined: i64,
    pub total_cost_saved: f64,
    pub pending_messages: i64,
    pub messages_quarantined_24h: i64,
    pub cost_saved_24h: f64,
    pub estimated_monthly_savings: f64,
}

// ---------------------------------------------------------------------------
// ProtocolManager
// ---------------------------------------------------------------------------

/// Per-user silence state: activation, deactivation, one-time passes, and
/// the inbound divert decision.
///
/// Divert decisions must be near-consistent reads, so states are cached for
/// at most a few seconds (`state_cache_secs`) and invalidated on every
/// transition.
pub struct ProtocolManager {
    store: Arc<dyn ProtocolStore>,
    config: ProtocolConfig,
    /// Users with a pending one-time pass.
    passes: DashMap<String, ()>,
    state_cache: DashMap<String, (ProtocolState, Instant)>,
}

impl ProtocolManager {
    pub fn new(store: Arc<dyn ProtocolStore>, config: ProtocolConfig) -> Self {
        Self {
            store,
            config,
            passes: DashMap::new(),
            state_cache: DashMap::new(),
        }
    }

    // -- transitions --------------------------------------------------------

    /// INACTIVE → ACTIVE. Already-active users are left untouched (no audit
    /// row for a non-transition).
    pub async fn activate(&self, user_id: &str, by: &str, reason: &str) -> Result<ProtocolState> {
        let mut state = self
            .store
            .get_state(user_id)
            .await
            .map_err(Error::from)?
            .unwrap_or_else(|| ProtocolState::inactive(user_id));

        if state.status == ProtocolStatus::Active {
            return Ok(state);
        }

        let previous = state.status;
        state.status = ProtocolStatus::Active;
        state.activated_by = Some(by.to_string());
        state.activated_at = Some(Utc::now());
        state.reason = Some(reason.to_string());
        state.updated_at = Utc::now();

        self.store.upsert_state(&state).await.map_err(Error::from)?;
        self.audit(user_id, AuditAction::Activate, by, Some(reason), previous, state.status)
            .await?;
        self.state_cache.remove(user_id);

        info!(user_id, by, reason, "silence protocol activated");
        Ok(state)
    }

    /// ACTIVE → INACTIVE.
    pub async fn deactivate(&self, user_id: &str, by: &str, reason: &str) -> Result<ProtocolState> {
        let mut state = self
            .store
            .get_state(user_id)
            .await
            .map_err(Error::from)?
            .unwrap_or_else(|| ProtocolState::inactive(user_id));

        if state.status == ProtocolStatus::Inactive {
            return Ok(state);
        }

        let previous = state.status;
        state.status = ProtocolStatus::Inactive;
        state.reason = Some(reason.to_string());
        state.updated_at = Utc::now();

        self.store.upsert_state(&state).await.map_err(Error::from)?;
        self.audit(user_id, AuditAction::Deactivate, by, Some(reason), previous, state.status)
            .await?;
        self.state_cache.remove(user_id);

        info!(user_id, by, reason, "silence protocol deactivated");
        Ok(state)
    }

    /// No state change: the user's *next* message passes through as if the
    /// protocol were inactive, then the pass is consumed.
    pub async fn one_time_pass(&self, user_id: &str, by: &str) -> Result<()> {
        let status = self
            .store
            .get_state(user_id)
            .await
            .map_err(Error::from)?
            .map(|s| s.status)
            .unwrap_or(ProtocolStatus::Inactive);

        self.passes.insert(user_id.to_string(), ());
        self.audit(user_id, AuditAction::OneTimePass, by, None, status, status)
            .await?;

        info!(user_id, by, "one-time pass granted");
        Ok(())
    }

    async fn audit(
        &self,
        user_id: &str,
        action: AuditAction,
        by: &str,
        reason: Option<&str>,
        previous: ProtocolStatus,
        new: ProtocolStatus,
    ) -> Result<()> {
        self.store
            .append_audit(&AuditEntry {
                user_id: user_id.to_string(),
                action,
                performed_by: by.to_string(),
                reason: reason.map(String::from),
                previous_status: previous,
                new_status: new,
                created_at: Utc::now(),
            })
            .await
            .map_err(Error::from)
    }

    // -- runtime hook -------------------------------------------------------

    /// Admission check for one inbound message. Errors here mean the caller
    /// cannot know the user's state; the pipeline fails closed on them.
    pub async fn check_inbound(&self, message: &InboundMessage) -> Result<Divert> {
        let status = self.current_status(&message.user_id).await?;

        if status == ProtocolStatus::Inactive {
            return Ok(Divert::PassThrough);
        }

        // One pending pass lets exactly one message through.
        if self.passes.remove(&message.user_id).is_some() {
            info!(user_id = %message.user_id, "one-time pass consumed");
            return Ok(Divert::PassThrough);
        }

        let quarantined = QuarantineMessage {
            id: Uuid::new_v4(),
            user_id: message.user_id.clone(),
            text: message.text.clone(),
            external_message_id: message.external_message_id.clone(),
            received_at: message.received_at,
            expires_at: message.received_at
                + ChronoDuration::days(self.config.quarantine_ttl_days),
            processed: false,
            processed_at: None,
            processed_by: None,
        };
        self.store
            .quarantine_insert(&quarantined, self.config.cost_per_message)
            .await
            .map_err(Error::from)?;
        self.state_cache.remove(&message.user_id);

        info!(
            user_id = %message.user_id,
            message_id = %quarantined.id,
            "message diverted to quarantine"
        );
        Ok(Divert::Diverted {
            message_id: quarantined.id,
        })
    }

    async fn current_status(&self, user_id: &str) -> Result<ProtocolStatus> {
        let max_age = Duration::from_secs(self.config.state_cache_secs);
        if let Some(entry) = self.state_cache.get(user_id) {
            let (state, stamped) = entry.value();
            if stamped.elapsed() < max_age {
                return Ok(state.status);
            }
        }

        let state = self
            .store
            .get_state(user_id)
            .await
            .map_err(Error::from)?
            .unwrap_or_else(|| ProtocolState::inactive(user_id));
        let status = state.status;
        self.state_cache
            .insert(user_id.to_string(), (state, Instant::now()));
        Ok(status)
    }

    // -- batch operations ---------------------------------------------------

    pub async fn list_messages(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QuarantineMessage>> {
        self.store
            .list_messages(user_id, limit)
            .await
            .map_err(Error::from)
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Option<QuarantineMessage>> {
        self.store.get_message(id).await.map_err(Error::from)
    }

    /// Mark messages processed. Batches above [`MAX_BATCH`] are refused.
    pub async fn process_messages(&self, ids: &[Uuid], by: &str) -> Result<usize> {
        if ids.len() > MAX_BATCH {
            return Err(Error::Validation(format!(
                "batch of {} exceeds the {MAX_BATCH}-message cap",
                ids.len()
            )));
        }
        self.store
            .mark_processed(ids, by, Utc::now())
            .await
            .map_err(Error::from)
    }

    pub async fn delete_messages(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.len() > MAX_BATCH {
            return Err(Error::Validation(format!(
                "batch of {} exceeds the {MAX_BATCH}-message cap",
                ids.len()
            )));
        }
        self.store.delete_messages(ids).await.map_err(Error::from)
    }

    /// Remove unprocessed rows past expiry. Driven by an hourly timer.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let purged = self
            .store
            .purge_expired(Utc::now())
            .await
            .map_err(Error::from)?;
        if purged > 0 {
            info!(purged, "expired quarantine messages removed");
        }
        Ok(purged)
    }

    pub async fn audit_log(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<AuditEntry>> {
        self.store.list_audit(user_id, limit).await.map_err(Error::from)
    }

    pub async fn get_state(&self, user_id: &str) -> Result<ProtocolState> {
        Ok(self
            .store
            .get_state(user_id)
            .await
            .map_err(Error::from)?
            .unwrap_or_else(|| ProtocolState::inactive(user_id)))
    }

    /// Current totals, 24-hour deltas, and the projected monthly savings.
    pub async fn stats(&self) -> Result<ProtocolStats> {
        let totals = self.store.totals(Utc::now()).await.map_err(Error::from)?;
        let cost_saved_24h = totals.messages_24h as f64 * self.config.cost_per_message;
        Ok(ProtocolStats {
            active_users: totals.active_users,
            total_messages_quarantined: totals.total_messages_quarantined,
            total_cost_saved: totals.total_cost_saved,
            pending_messages: totals.pending_messages,
            messages_quarantined_24h: totals.messages_24h,
            cost_saved_24h,
            estimated_monthly_savings: cost_saved_24h * 30.0,
        })
    }

    /// Spawn the hourly expiry sweep. Never dies: failures are logged and
    /// the next tick proceeds.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(manager.config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.cleanup_expired().await {
                    warn!(error = %e, "quarantine cleanup tick failed");
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
