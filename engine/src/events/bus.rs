//! Event bus for pipeline coordination
//!
//! Provides pub/sub messaging using Tokio broadcast channels with
//! optional persistence to RocksDB for the audit trail and replay.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::PipelineEvent;
use crate::state::SharedStateStore;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Failed to send event: {0}")]
    SendFailed(String),

    #[error("Failed to persist event: {0}")]
    PersistFailed(String),

    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channels and optional persistence
pub struct EventBus {
    /// Broadcast sender for publishing events
    sender: broadcast::Sender<PipelineEvent>,

    /// Optional state store for event persistence
    store: Option<SharedStateStore>,
}

impl EventBus {
    /// Create a new event bus without persistence
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            store: None,
        }
    }

    /// Create an event bus that persists every event to the store
    pub fn with_persistence(store: SharedStateStore) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            store: Some(store),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: PipelineEvent) -> EventBusResult<()> {
        let event_type = event.event_type();
        let timestamp = event.timestamp();

        if let Some(store) = &self.store {
            let event_id = PipelineEvent::new_id();
            let timestamp_nanos = timestamp.timestamp_nanos_opt().unwrap_or(0);

            if let Err(e) = store.put_event(timestamp_nanos, &event_id, &event) {
                warn!(event_type, "Failed to persist event: {}", e);
                return Err(EventBusError::PersistFailed(e.to_string()));
            }
        }

        // Broadcast to subscribers; no receivers is fine, the event is
        // already persisted.
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "Event published");
            }
            Err(_) => {
                debug!(event_type, "Event published (no receivers)");
            }
        }
        Ok(())
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
