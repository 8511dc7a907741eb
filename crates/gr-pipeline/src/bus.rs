use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Signals flowing between the control surface and the pipeline workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A reviewer approved an interaction; delivery should pick it up.
    Approved { interaction_id: Uuid },
    /// A user-level cancellation: abort in-flight work for this user.
    Cancelled { user_id: String },
}

/// Broadcast bus over flume channels. Each [`subscribe`](EventBus::subscribe)
/// gets every event published afterwards; dropped receivers are pruned on
/// the next publish. Cloning shares the same bus.
#[derive(Clone)]
pub struct EventBus {
    senders: Arc<Mutex<Vec<flume::Sender<PipelineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<PipelineEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders.lock().expect("event bus lock").push(tx);
        rx
    }

    pub fn publish(&self, event: PipelineEvent) {
        let mut senders = self.senders.lock().expect("event bus lock");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().expect("event bus lock").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
