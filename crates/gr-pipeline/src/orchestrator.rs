use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::delivery::DeliveryWorker;
use crate::policy::{priority_score, PolicyFilter};
use crate::providers::{BubbleRefiner, DraftGenerator};
use crate::retry::{retry_with_backoff, RetryPolicy};
use gr_core::config::PipelineConfig;
use gr_core::types::{InboundMessage, Interaction, ReviewStatus};
use gr_core::{Error, Result};
use gr_knowledge::ContextBuilder;
use gr_limiter::{EnhancedRateLimiter, RateLimitDecision};
use gr_protocol::{Divert, ProtocolManager};
use gr_review::ReviewStore;
use gr_telemetry::MetricsCollector;

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Lane {
    queue: VecDeque<InboundMessage>,
    /// A debounce timer is pending for this lane.
    scheduled: bool,
    /// A worker is currently processing this lane.
    busy: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Core {
    protocol: Arc<ProtocolManager>,
    context: Arc<ContextBuilder>,
    generator: Arc<dyn DraftGenerator>,
    refiner: Arc<dyn BubbleRefiner>,
    policy: PolicyFilter,
    reviews: Arc<dyn ReviewStore>,
    limiter: Arc<EnhancedRateLimiter>,
    metrics: Arc<MetricsCollector>,
    delivery: Arc<DeliveryWorker>,
    config: PipelineConfig,
    retry: RetryPolicy,
    lanes: DashMap<String, Lane>,
    cancelled: DashMap<String, ()>,
    accepting: AtomicBool,
    active_turns: AtomicUsize,
    work_tx: flume::Sender<String>,
}

/// The inbound side of the pipeline. Messages enter per-user lanes; a short
/// debounce window coalesces bursts into one logical turn; N workers pull
/// ready lanes off a shared channel, so one user's turns are strictly
/// serialized while different users proceed in parallel.
pub struct Orchestrator {
    core: Arc<Core>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        protocol: Arc<ProtocolManager>,
        context: Arc<ContextBuilder>,
        generator: Arc<dyn DraftGenerator>,
        refiner: Arc<dyn BubbleRefiner>,
        reviews: Arc<dyn ReviewStore>,
        limiter: Arc<EnhancedRateLimiter>,
        metrics: Arc<MetricsCollector>,
        delivery: Arc<DeliveryWorker>,
        config: PipelineConfig,
        retry: RetryPolicy,
    ) -> Self {
        let (work_tx, work_rx) = flume::unbounded::<String>();
        let core = Arc::new(Core {
            protocol,
            context,
            generator,
            refiner,
            policy: PolicyFilter::new(),
            reviews,
            limiter,
            metrics,
            delivery,
            config,
            retry,
            lanes: DashMap::new(),
            cancelled: DashMap::new(),
            accepting: AtomicBool::new(true),
            active_turns: AtomicUsize::new(0),
            work_tx,
        });

        let worker_count = if core.config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            core.config.workers
        };

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let core = Arc::clone(&core);
            let rx = work_rx.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker_id, "pipeline worker started");
                while let Ok(user_id) = rx.recv_async().await {
                    core.process_lane(&user_id).await;
                }
                debug!(worker_id, "pipeline worker stopped");
            }));
        }

        info!(workers = worker_count, "pipeline orchestrator started");
        Self { core, workers }
    }

    /// Accept one inbound message into its user's lane. Bounded per lane:
    /// overflow drops the oldest queued message.
    pub fn submit(&self, message: InboundMessage) -> Result<()> {
        if !self.core.accepting.load(Ordering::SeqCst) {
            return Err(Error::Transient("pipeline is shutting down".into()));
        }
        if self.core.cancelled.contains_key(&message.user_id) {
            debug!(user_id = %message.user_id, "dropping message for cancelled user");
            return Ok(());
        }

        let user_id = message.user_id.clone();
        let schedule = {
            let mut lane = self.core.lanes.entry(user_id.clone()).or_default();
            if lane.queue.len() >= self.core.config.lane_capacity {
                lane.queue.pop_front();
                self.core
                    .metrics
                    .increment_counter("backpressure_drop", &[]);
                warn!(user_id = %user_id, "lane over capacity – dropped oldest message");
            }
            lane.queue.push_back(message);
            if lane.scheduled || lane.busy {
                false
            } else {
                lane.scheduled = true;
                true
            }
        };

        if schedule {
            let core = Arc::clone(&self.core);
            let user = user_id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(core.config.debounce_ms)).await;
                let _ = core.work_tx.send_async(user).await;
            });
        }
        Ok(())
    }

    /// Startup recovery: return stale in-review rows to the queue and
    /// re-enqueue approved-but-undelivered replies.
    pub async fn recover(&self) -> Result<()> {
        let now = Utc::now();

        let stale = self
            .core
            .reviews
            .reclaim_stale(now - ChronoDuration::minutes(self.core.config.stale_review_minutes))
            .await?;
        if !stale.is_empty() {
            info!(count = stale.len(), "reclaimed stale in-review interactions");
        }

        let undelivered = self
            .core
            .reviews
            .approved_undelivered(now - ChronoDuration::seconds(self.core.config.redelivery_after_secs))
            .await?;
        for interaction in &undelivered {
            self.core.delivery.enqueue(interaction.id).await;
        }
        if !undelivered.is_empty() {
            info!(count = undelivered.len(), "re-enqueued undelivered approvals");
        }
        Ok(())
    }

    /// User-level cancellation: drop queued work, abort future processing,
    /// and tag staged interactions for non-delivery. Rows stay for audit.
    pub async fn cancel_user(&self, user_id: &str) -> Result<usize> {
        self.core.cancelled.insert(user_id.to_string(), ());
        if let Some(mut lane) = self.core.lanes.get_mut(user_id) {
            lane.queue.clear();
        }
        let held = self.core.reviews.hold_user_deliveries(user_id).await?;
        info!(user_id, held, "user cancelled – deliveries held");
        Ok(held)
    }

    /// Refuse new work, drain in-flight lanes up to `grace`, then abort the
    /// workers. Staged interactions remain the durable record.
    pub async fn shutdown(&self, grace: Duration) {
        self.core.accepting.store(false, Ordering::SeqCst);
        info!("pipeline draining");

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let busy = self.core.active_turns.load(Ordering::SeqCst);
            let queued: usize = self.core.lanes.iter().map(|l| l.queue.len()).sum();
            if busy == 0 && queued == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(busy, queued, "shutdown grace elapsed – aborting lanes");
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        for handle in &self.workers {
            handle.abort();
        }
        info!("pipeline stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.core.accepting.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Per-lane processing
// ---------------------------------------------------------------------------

impl Core {
    async fn process_lane(self: &Arc<Self>, user_id: &str) {
        // Take the whole burst as one logical turn.
        let batch: Vec<InboundMessage> = {
            let Some(mut lane) = self.lanes.get_mut(user_id) else {
                return;
            };
            lane.scheduled = false;
            if lane.busy {
                return;
            }
            lane.busy = true;
            lane.queue.drain(..).collect()
        };

        if batch.is_empty() || self.cancelled.contains_key(user_id) {
            self.release_lane(user_id);
            return;
        }

        let turn = coalesce(batch);
        self.active_turns.fetch_add(1, Ordering::SeqCst);
        let started = std::time::Instant::now();

        let deadline = Duration::from_secs(self.config.message_deadline_secs);
        match tokio::time::timeout(deadline, self.process_turn(&turn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(user_id, error = %e, "turn processing failed");
                self.metrics
                    .increment_counter("pipeline_turns_total", &[("outcome", "error")]);
            }
            Err(_) => {
                warn!(user_id, "turn processing hit the end-to-end deadline");
                self.metrics
                    .increment_counter("pipeline_turns_total", &[("outcome", "deadline")]);
            }
        }

        self.metrics
            .record_histogram("pipeline_turn_duration_seconds", started.elapsed().as_secs_f64());
        self.active_turns.fetch_sub(1, Ordering::SeqCst);
        self.release_lane(user_id);
    }

    fn release_lane(self: &Arc<Self>, user_id: &str) {
        let reschedule = {
            let Some(mut lane) = self.lanes.get_mut(user_id) else {
                return;
            };
            lane.busy = false;
            if lane.queue.is_empty() {
                drop(lane);
                self.lanes
                    .remove_if(user_id, |_, lane| lane.queue.is_empty() && !lane.busy && !lane.scheduled);
                false
            } else {
                lane.scheduled = true;
                true
            }
        };

        if reschedule {
            let core = Arc::clone(self);
            let user = user_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(core.config.debounce_ms)).await;
                let _ = core.work_tx.send_async(user).await;
            });
        }
    }

    async fn process_turn(&self, message: &InboundMessage) -> Result<()> {
        let user_id = &message.user_id;

        // 1. Admission. A protocol error means unknown state: fail closed
        // rather than spend provider budget on a possibly silenced user.
        match self.protocol.check_inbound(message).await {
            Ok(Divert::PassThrough) => {}
            Ok(Divert::Diverted { message_id }) => {
                debug!(user_id, %message_id, "turn diverted to quarantine");
                self.metrics
                    .increment_counter("pipeline_turns_total", &[("outcome", "diverted")]);
                return Ok(());
            }
            Err(e) => {
                warn!(user_id, error = %e, "protocol check failed – failing closed");
                self.metrics
                    .increment_counter("pipeline_turns_total", &[("outcome", "protocol_error")]);
                return Ok(());
            }
        }

        // 2. Context.
        let enhancement = self.context.build(user_id, &message.text).await;
        debug!(
            user_id,
            confidence = enhancement.confidence,
            enhanced = enhancement.enhanced_text != message.text,
            "context built"
        );

        // 3. Creative draft, throttled and retried.
        let draft = match self
            .provider_call("draft", || async {
                self.generator
                    .draft(&enhancement.enhanced_text)
                    .await
                    .map_err(Error::from)
            })
            .await
        {
            Ok(draft) => draft,
            Err(e) => {
                return self
                    .stage_failed(message, "generation_failed", &e)
                    .await
            }
        };

        if self.cancelled.contains_key(user_id) {
            debug!(user_id, "cancelled mid-turn – discarding draft");
            return Ok(());
        }

        // 4. Refinement into bubbles.
        let bubbles = match self
            .provider_call("refine", || async {
                self.refiner.refine(&draft).await.map_err(Error::from)
            })
            .await
        {
            Ok(bubbles) => bubbles,
            Err(e) => {
                return self
                    .stage_failed(message, "refinement_failed", &e)
                    .await
            }
        };

        // 5. Policy filter.
        let verdict = self.policy.evaluate(&message.text, &bubbles);

        if self.cancelled.contains_key(user_id) {
            debug!(user_id, "cancelled before staging – discarding turn");
            return Ok(());
        }

        // 6. Stage for review. A policy reject short-circuits into a
        // pre-rejected row so reviewers can still see what was blocked.
        let mut interaction =
            Interaction::pending(user_id.clone(), message.text.clone(), draft, bubbles);
        interaction.risk_score = verdict.risk_score;
        interaction.risk_flags = verdict.risk_flags.clone();
        interaction.risk_recommendation = verdict.risk_recommendation;
        interaction.priority_score = priority_score(&verdict, &message.text, message.received_at);

        let outcome = if verdict.risk_recommendation == gr_core::types::RiskRecommendation::Reject {
            interaction.review_status = ReviewStatus::Rejected;
            interaction.decided_at = Some(Utc::now());
            interaction.reviewer_notes = Some("rejected by policy filter".into());
            "policy_rejected"
        } else {
            "staged"
        };

        self.reviews.stage(&interaction).await?;
        self.metrics
            .increment_counter("pipeline_turns_total", &[("outcome", outcome)]);
        info!(
            user_id,
            interaction_id = %interaction.id,
            risk = verdict.risk_score,
            outcome,
            "turn staged"
        );
        Ok(())
    }

    /// One provider call under the outbound throttle and the retry budget.
    async fn provider_call<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.retry, key, || async {
            match self.limiter.check_provider(key).await {
                RateLimitDecision::Allowed { .. } => {}
                RateLimitDecision::Blocked {
                    retry_after_secs, ..
                } => {
                    return Err(Error::RateLimited {
                        // The block may be long; the retry budget caps what
                        // we actually wait.
                        retry_after_secs,
                    });
                }
            }
            f().await
        })
        .await
    }

    /// Provider budget exhausted: record a failed interaction so reviewers
    /// can see the turn, without messaging the user.
    async fn stage_failed(
        &self,
        message: &InboundMessage,
        flag: &str,
        cause: &Error,
    ) -> Result<()> {
        let mut interaction = Interaction::pending(
            message.user_id.clone(),
            message.text.clone(),
            String::new(),
            Vec::new(),
        );
        interaction.review_status = ReviewStatus::Rejected;
        interaction.risk_flags = vec![flag.to_string()];
        interaction.reviewer_notes = Some(format!("pipeline failure: {cause}"));
        interaction.decided_at = Some(Utc::now());

        self.reviews.stage(&interaction).await?;
        self.metrics
            .increment_counter("pipeline_turns_total", &[("outcome", flag)]);
        error!(
            user_id = %message.user_id,
            interaction_id = %interaction.id,
            flag,
            error = %cause,
            "turn failed – staged for visibility"
        );
        Ok(())
    }
}

/// Merge a debounced burst into one logical turn.
fn coalesce(batch: Vec<InboundMessage>) -> InboundMessage {
    let user_id = batch[0].user_id.clone();
    let received_at = batch[0].received_at;
    let external_message_id = batch.iter().rev().find_map(|m| m.external_message_id.clone());
    let text = batch
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    InboundMessage {
        user_id,
        text,
        external_message_id,
        received_at,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
