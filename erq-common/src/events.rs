//! Event types and the in-process event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Ingestion lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ErqEvent {
    CycleStarted {
        cycle_id: Uuid,
        source: String,
        timestamp: DateTime<Utc>,
    },
    /// Another trigger holds the source lease
    CycleSkipped {
        source: String,
        timestamp: DateTime<Utc>,
    },
    CycleCommitted {
        cycle_id: Uuid,
        source: String,
        rows_parsed: usize,
        rows_valid: usize,
        anomalies: usize,
        timestamp: DateTime<Utc>,
    },
    CycleFailed {
        cycle_id: Uuid,
        source: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ErqEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ErqEvent::CycleStarted { .. } => "CycleStarted",
            ErqEvent::CycleSkipped { .. } => "CycleSkipped",
            ErqEvent::CycleCommitted { .. } => "CycleCommitted",
            ErqEvent::CycleFailed { .. } => "CycleFailed",
        }
    }
}

/// Broadcast bus; slow subscribers lose the oldest events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ErqEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ErqEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; `Err` when nobody is listening
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: ErqEvent) -> Result<usize, broadcast::error::SendError<ErqEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ErqEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit_lossy(ErqEvent::CycleSkipped {
            source: "msss".to_string(),
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "CycleSkipped");
    }

    #[test]
    fn emit_without_subscribers_errors() {
        let bus = EventBus::new(4);
        let result = bus.emit(ErqEvent::CycleSkipped {
            source: "msss".to_string(),
            timestamp: Utc::now(),
        });
        assert!(result.is_err());
        assert_eq!(bus.capacity(), 4);
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = ErqEvent::CycleFailed {
            cycle_id: Uuid::nil(),
            source: "msss".to_string(),
            error: "timeout".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "CycleFailed");
        assert_eq!(json["error"], "timeout");
    }
}
