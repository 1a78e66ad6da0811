// Event payloads for the at-least-once bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event published on the bus
///
/// Immutable once published. `event_id` is the idempotency key: the engine
/// deduplicates by it before transitioning a waiting step, so redelivering
/// a previously-seen event is a no-op. Topics are free-form strings matched
/// exactly by event-wait steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub event_id: Uuid,
    pub payload: serde_json::Value,
    pub produced_at: DateTime<Utc>,
}

impl Event {
    pub fn new<T: Into<String>>(topic: T, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            event_id: Uuid::new_v4(),
            payload,
            produced_at: Utc::now(),
        }
    }
}
