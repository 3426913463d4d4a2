//! Agent events — what the orchestrator tells the UI layer.
//!
//! Events are published as a turn progresses. Renderers subscribe and
//! filter for what they care about; nothing in the loop waits on them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::tool::{DangerClass, ToolStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStarted {
        session_id: String,
    },

    /// A fragment of streamed assistant text
    TextDelta {
        session_id: String,
        delta: String,
    },

    /// The assistant message for one request is complete
    TextComplete {
        session_id: String,
        text: String,
    },

    ToolCallStarted {
        session_id: String,
        call_id: String,
        tool: String,
        arguments: String,
    },

    /// The turn is parked waiting for a human decision
    ApprovalRequested {
        session_id: String,
        call_id: String,
        tool: String,
        danger_class: DangerClass,
    },

    /// Published once for every result in a batch, including calls that
    /// were denied, rejected or cancelled without running
    ToolCallCompleted {
        session_id: String,
        call_id: String,
        tool: String,
        status: ToolStatus,
        /// Error, denial or cancellation text; `None` on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        /// Execution time; zero when the tool never ran
        duration_ms: u64,
    },

    TurnFailed {
        session_id: String,
        error: String,
    },

    TurnCompleted {
        session_id: String,
        batches: u32,
        tool_calls: u32,
        cancelled: bool,
    },
}

/// A broadcast-based event bus for agent events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag and lose old events rather than blocking the loop.
pub struct EventBus {
    sender: broadcast::Sender<Arc<AgentEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AgentEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(AgentEvent::ToolCallCompleted {
            session_id: "s1".into(),
            call_id: "c1".into(),
            tool: "shell".into(),
            status: ToolStatus::Success,
            detail: None,
            duration_ms: 42,
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            AgentEvent::ToolCallCompleted { tool, status, .. } => {
                assert_eq!(tool, "shell");
                assert_eq!(*status, ToolStatus::Success);
            }
            _ => panic!("Expected ToolCallCompleted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(AgentEvent::TurnFailed {
            session_id: "s1".into(),
            error: "no subscribers".into(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let value = serde_json::to_value(AgentEvent::TurnStarted {
            session_id: "s1".into(),
        })
        .unwrap();
        assert_eq!(value["event"], "turn_started");
    }
}
