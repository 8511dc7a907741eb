use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::PipelineEvent;
use crate::policy::importance_heuristic;
use gr_core::types::{MemoryItem, MemoryType, MetaValue, ReviewStatus};
use gr_core::{Error, Result};
use gr_memory::TieredMemoryManager;
use gr_review::ReviewStore;
use gr_telemetry::MetricsCollector;

// ---------------------------------------------------------------------------
// OutboundTransport
// ---------------------------------------------------------------------------

/// The seam to the chat platform: emits one bubble as one user-visible
/// message.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send_bubble(&self, user_id: &str, text: &str) -> Result<()>;
}

/// Logs outbound bubbles. Default when no platform transport is wired.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl OutboundTransport for LogTransport {
    async fn send_bubble(&self, user_id: &str, text: &str) -> Result<()> {
        info!(user_id, text, "outbound bubble");
        Ok(())
    }
}

/// Test transport: captures `(user_id, text, at)` on a channel.
pub struct ChannelTransport {
    tx: flume::Sender<(String, String, std::time::Instant)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, flume::Receiver<(String, String, std::time::Instant)>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OutboundTransport for ChannelTransport {
    async fn send_bubble(&self, user_id: &str, text: &str) -> Result<()> {
        self.tx
            .send((user_id.to_string(), text.to_string(), std::time::Instant::now()))
            .map_err(|_| Error::Transient("outbound channel closed".into()))
    }
}

// ---------------------------------------------------------------------------
// DeliveryWorker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeliveryLane {
    queue: VecDeque<Uuid>,
    draining: bool,
}

/// Emits approved replies bubble by bubble, in approval order per user,
/// with a configurable inter-bubble delay. Marks rows delivered and writes
/// the conversation memory afterwards.
pub struct DeliveryWorker {
    reviews: Arc<dyn ReviewStore>,
    transport: Arc<dyn OutboundTransport>,
    memory: Option<Arc<TieredMemoryManager>>,
    metrics: Arc<MetricsCollector>,
    bubble_delay: Duration,
    lanes: DashMap<String, DeliveryLane>,
}

impl DeliveryWorker {
    pub fn new(
        reviews: Arc<dyn ReviewStore>,
        transport: Arc<dyn OutboundTransport>,
        memory: Option<Arc<TieredMemoryManager>>,
        metrics: Arc<MetricsCollector>,
        bubble_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            reviews,
            transport,
            memory,
            metrics,
            bubble_delay,
            lanes: DashMap::new(),
        })
    }

    /// Queue an approved interaction for delivery. Per-user lanes drain in
    /// enqueue order, which the control surface guarantees is approval
    /// order.
    pub async fn enqueue(self: &Arc<Self>, interaction_id: Uuid) {
        let interaction = match self.reviews.get(interaction_id).await {
            Ok(Some(i)) => i,
            Ok(None) => {
                warn!(%interaction_id, "delivery requested for unknown interaction");
                return;
            }
            Err(e) => {
                warn!(%interaction_id, error = %e, "could not load interaction for delivery");
                return;
            }
        };

        let user_id = interaction.user_id.clone();
        let spawn_drainer = {
            let mut lane = self.lanes.entry(user_id.clone()).or_default();
            lane.queue.push_back(interaction_id);
            if lane.draining {
                false
            } else {
                lane.draining = true;
                true
            }
        };

        if spawn_drainer {
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                worker.drain(user_id).await;
            });
        }
    }

    async fn drain(self: Arc<Self>, user_id: String) {
        loop {
            let next = {
                let Some(mut lane) = self.lanes.get_mut(&user_id) else {
                    break;
                };
                match lane.queue.pop_front() {
                    Some(id) => id,
                    None => {
                        lane.draining = false;
                        drop(lane);
                        self.lanes
                            .remove_if(&user_id, |_, lane| lane.queue.is_empty() && !lane.draining);
                        break;
                    }
                }
            };

            if let Err(e) = self.deliver_one(next).await {
                warn!(interaction_id = %next, error = %e, "delivery failed");
                self.metrics
                    .increment_counter("deliveries_total", &[("outcome", "failed")]);
            }
        }
    }

    async fn deliver_one(&self, interaction_id: Uuid) -> Result<()> {
        let started = std::time::Instant::now();
        let interaction = self
            .reviews
            .get(interaction_id)
            .await?
            .ok_or_else(|| Error::Conflict(format!("interaction {interaction_id} not found")))?;

        match interaction.review_status {
            ReviewStatus::Approved if !interaction.delivery_hold => {}
            ReviewStatus::Delivered => {
                debug!(%interaction_id, "already delivered");
                return Ok(());
            }
            _ => {
                debug!(
                    %interaction_id,
                    status = interaction.review_status.as_str(),
                    hold = interaction.delivery_hold,
                    "skipping non-deliverable interaction"
                );
                return Ok(());
            }
        }

        let bubbles = interaction
            .final_bubbles
            .clone()
            .ok_or_else(|| Error::Failure(format!("approved {interaction_id} has no bubbles")))?;

        for (i, bubble) in bubbles.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.bubble_delay).await;
            }
            self.transport
                .send_bubble(&interaction.user_id, bubble)
                .await?;
        }

        self.reviews.mark_delivered(interaction_id).await?;
        self.metrics
            .increment_counter("deliveries_total", &[("outcome", "delivered")]);
        self.metrics
            .record_histogram("delivery_duration_seconds", started.elapsed().as_secs_f64());
        info!(
            %interaction_id,
            user_id = %interaction.user_id,
            bubbles = bubbles.len(),
            "reply delivered"
        );

        self.write_conversation_memory(&interaction, &bubbles).await;
        Ok(())
    }

    async fn write_conversation_memory(
        &self,
        interaction: &gr_core::types::Interaction,
        bubbles: &[String],
    ) {
        let Some(memory) = &self.memory else {
            return;
        };

        let content = format!(
            "User: {}\nAssistant: {}",
            interaction.user_message,
            bubbles.join(" ")
        );
        let importance = importance_heuristic(&interaction.user_message);
        let mut item = MemoryItem::new(
            interaction.user_id.clone(),
            content,
            MemoryType::Conversation,
            importance,
        );
        item.metadata.insert(
            "interaction_id".to_string(),
            MetaValue::Str(interaction.id.to_string()),
        );

        if let Err(e) = memory.store(item, true).await {
            warn!(
                interaction_id = %interaction.id,
                error = %e,
                "post-delivery memory write failed"
            );
        }
    }

    /// Consume approval events from the bus until it closes.
    pub fn run(self: Arc<Self>, rx: flume::Receiver<PipelineEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                if let PipelineEvent::Approved { interaction_id } = event {
                    self.enqueue(interaction_id).await;
                }
            }
            debug!("delivery worker bus closed");
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use gr_core::types::Interaction;
    use gr_review::{ApproveRequest, InMemoryReviewStore};

    async fn approved_interaction(
        store: &InMemoryReviewStore,
        user: &str,
        bubbles: &[&str],
    ) -> Uuid {
        let i = Interaction::pending(user, "hello", "raw", vec!["draft".into()]);
        let id = store.stage(&i).await.unwrap();
        store.claim(id, "rev_a").await.unwrap();
        store
            .approve(
                id,
                "rev_a",
                ApproveRequest {
                    final_bubbles: bubbles.iter().map(|s| s.to_string()).collect(),
                    edit_tags: vec![],
                    quality_score: Some(4),
                    reviewer_notes: None,
                },
            )
            .await
            .unwrap();
        id
    }

    fn worker(
        store: Arc<InMemoryReviewStore>,
        delay_ms: u64,
    ) -> (
        Arc<DeliveryWorker>,
        flume::Receiver<(String, String, std::time::Instant)>,
    ) {
        let (transport, rx) = ChannelTransport::new();
        let worker = DeliveryWorker::new(
            store,
            Arc::new(transport),
            None,
            Arc::new(MetricsCollector::with_defaults()),
            Duration::from_millis(delay_ms),
        );
        (worker, rx)
    }

    #[tokio::test]
    async fn bubbles_emit_in_order_with_spacing() {
        let store = Arc::new(InMemoryReviewStore::new());
        let id = approved_interaction(&store, "u1", &["hi", "how are you"]).await;
        let (worker, rx) = worker(store.clone(), 50);

        worker.enqueue(id).await;

        let (_, first, t1) = rx.recv_async().await.unwrap();
        let (_, second, t2) = rx.recv_async().await.unwrap();
        assert_eq!(first, "hi");
        assert_eq!(second, "how are you");
        assert!(t2.duration_since(t1) >= Duration::from_millis(50));

        // Wait for the drainer to mark the row.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.review_status, ReviewStatus::Delivered);
        assert!(row.delivered_at.is_some());
    }

    #[tokio::test]
    async fn per_user_deliveries_follow_approval_order() {
        let store = Arc::new(InMemoryReviewStore::new());
        let first = approved_interaction(&store, "u1", &["one"]).await;
        let second = approved_interaction(&store, "u1", &["two"]).await;
        let (worker, rx) = worker(store.clone(), 5);

        worker.enqueue(first).await;
        worker.enqueue(second).await;

        let (_, a, _) = rx.recv_async().await.unwrap();
        let (_, b, _) = rx.recv_async().await.unwrap();
        assert_eq!(a, "one");
        assert_eq!(b, "two");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let f = store.get(first).await.unwrap().unwrap();
        let s = store.get(second).await.unwrap().unwrap();
        assert!(f.delivered_at.unwrap() <= s.delivered_at.unwrap());
    }

    #[tokio::test]
    async fn held_interactions_are_skipped() {
        let store = Arc::new(InMemoryReviewStore::new());
        let id = approved_interaction(&store, "u1", &["never"]).await;
        store.hold_user_deliveries("u1").await.unwrap();
        let (worker, rx) = worker(store.clone(), 5);

        worker.enqueue(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.review_status, ReviewStatus::Approved);
        assert!(row.delivered_at.is_none());
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let store = Arc::new(InMemoryReviewStore::new());
        let id = approved_interaction(&store, "u1", &["once"]).await;
        let (worker, rx) = worker(store.clone(), 5);

        worker.enqueue(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.enqueue(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the first enqueue emitted anything.
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test]
    async fn bus_events_drive_delivery() {
        let store = Arc::new(InMemoryReviewStore::new());
        let id = approved_interaction(&store, "u1", &["from the bus"]).await;
        let (worker, rx) = worker(store.clone(), 5);

        let bus = crate::bus::EventBus::new();
        let handle = worker.run(bus.subscribe());
        bus.publish(PipelineEvent::Approved { interaction_id: id });

        let (_, text, _) = rx.recv_async().await.unwrap();
        assert_eq!(text, "from the bus");

        drop(bus);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn memory_written_after_delivery() {
        use gr_core::config::MemoryConfig;
        use gr_knowledge::{EmbeddingService, LocalEmbedder};
        use gr_memory::{InMemoryWarmStore, RetrieveRequest};
        use gr_stores::MemoryKv;

        let memory = Arc::new(TieredMemoryManager::new(
            Arc::new(MemoryKv::new()),
            Arc::new(InMemoryWarmStore::new()),
            None,
            Arc::new(EmbeddingService::new(
                Arc::new(LocalEmbedder::new("test")),
                16,
            )),
            MemoryConfig::default(),
        ));

        let store = Arc::new(InMemoryReviewStore::new());
        let id = approved_interaction(&store, "u1", &["hi", "how are you"]).await;
        let (transport, _rx) = ChannelTransport::new();
        let worker = DeliveryWorker::new(
            store,
            Arc::new(transport),
            Some(memory.clone()),
            Arc::new(MetricsCollector::with_defaults()),
            Duration::from_millis(1),
        );

        worker.enqueue(id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let req = RetrieveRequest {
            limit: 10,
            ..Default::default()
        };
        let items = memory.retrieve("u1", &req).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].importance >= 0.3);
        assert!(items[0].content.contains("hello"));
        assert!(items[0].content.contains("how are you"));
    }
}
