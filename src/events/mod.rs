//! Typed event bus between the core and the view layer
//!
//! Every outbound event traverses this bus as an [`EventEnvelope`]. The
//! envelope carries the addressable `(agent_id, session_id)` pair whenever it
//! applies, so the view can route without inspecting payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Well-known event names
pub mod names {
    pub const WORKSPACE_LOADED: &str = "workspace:loaded";
    pub const WORKSPACE_CHANGED: &str = "workspace:changed";
    pub const AGENT_ADDED: &str = "agent:added";
    pub const AGENT_REMOVED: &str = "agent:removed";
    pub const SESSION_MESSAGES: &str = "session:messages";
    pub const UNREAD_CHANGED: &str = "unread:changed";
    pub const RESPONSE_COMPLETE: &str = "response_complete";
    pub const MCP_ASK_USER: &str = "mcp:askuser";
    pub const MCP_PLAN_REVIEW: &str = "mcp:planreview";
    pub const MCP_PERMISSION_REQUEST: &str = "mcp:permission_request";
    pub const MCP_INBOX: &str = "mcp:inbox";
    pub const MCP_NOTIFICATION: &str = "mcp:notification";
    pub const BACKLOG_CHANGED: &str = "backlog:changed";
    pub const LOADING_STATUS: &str = "loading:status";
}

/// Envelope published to the view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(event: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            agent_id: None,
            session_id: None,
            payload,
        }
    }

    pub fn for_agent(event: &str, agent_id: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            agent_id: Some(agent_id.to_string()),
            session_id: None,
            payload,
        }
    }

    pub fn for_session(event: &str, agent_id: &str, session_id: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            agent_id: Some(agent_id.to_string()),
            session_id: Some(session_id.to_string()),
            payload,
        }
    }
}

/// Broadcast bus; subscribers are views or tests
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an envelope. Lagging or absent subscribers are not an error.
    pub fn publish(&self, envelope: EventEnvelope) {
        tracing::debug!(event = %envelope.event, "publishing event");
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EventEnvelope::for_session(
            names::SESSION_MESSAGES,
            "agent-1",
            "sess-1",
            json!({"count": 2}),
        ));

        let env = rx.recv().await.unwrap();
        assert_eq!(env.event, names::SESSION_MESSAGES);
        assert_eq!(env.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(env.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(EventEnvelope::new(names::LOADING_STATUS, json!("idle")));
    }
}
