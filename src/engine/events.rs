// Event system for event-driven steps and cross-workflow signaling

//! # Event System
//!
//! This module provides the event bus that connects external producers to
//! event-wait steps and lets workflow instances signal each other. It
//! handles:
//! - Event publication with generated idempotency ids
//! - Subscription and routing over a broadcast channel
//! - Engine lifecycle notifications (instance reached a terminal state)
//!
//! Delivery is at-least-once per subscriber: a slow subscriber that
//! overruns the channel buffer misses old events but producers may
//! republish, and consumers must deduplicate by `event_id`. The engine
//! keeps a consumed-id set for its waiting steps, so redelivery is a
//! no-op there.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Event, StepId, StepStatus, WorkflowInstance};
use crate::Result;

/// Topic for engine lifecycle events, published when an instance reaches
/// a terminal state; other workflows can event-wait on it
pub const TOPIC_INSTANCE_FINISHED: &str = "conductor.instance.finished";

/// Event bus for publishing and subscribing to workflow events
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self { sender }
    }

    /// Publish a new event, returning its generated id
    pub async fn publish<T: Into<String>>(
        &self,
        topic: T,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let event = Event::new(topic, payload);
        let id = event.event_id;
        self.publish_event(event).await?;
        Ok(id)
    }

    /// Publish a pre-built event
    ///
    /// Used for redelivery: publishing the same event twice carries the
    /// same `event_id`, which consumers treat as already seen.
    pub async fn publish_event(&self, event: Event) -> Result<()> {
        debug!(topic = %event.topic, event_id = %event.event_id, "event published");
        // A send error only means there are no subscribers right now
        let _ = self.sender.send(event);
        Ok(())
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Subscribe as an async stream, for external consumers
    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Emit the lifecycle notification for a finished instance
    pub async fn emit_instance_finished(&self, instance: &WorkflowInstance) -> Result<()> {
        let payload = serde_json::json!({
            "instance_id": instance.id,
            "definition_id": instance.definition_id,
            "status": instance.status,
        });
        self.publish(TOPIC_INSTANCE_FINISHED, payload).await?;
        Ok(())
    }

    /// Emit a step-completion signal other workflows can wait on
    pub async fn emit_step_finished(
        &self,
        instance: &WorkflowInstance,
        step: &StepId,
        status: StepStatus,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "instance_id": instance.id,
            "step_id": step,
            "status": status,
        });
        self.publish(format!("conductor.step.{}", step), payload)
            .await?;
        Ok(())
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
