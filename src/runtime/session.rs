//! Per-session in-memory state
//!
//! A session's truth is its log file; this state is the folded view plus the
//! bookkeeping the view layer needs: optimistic pending messages, unread
//! tracking, send timestamps for the resume gate, and the queued sends that
//! dispatch when the running child finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use crate::classify::{Message, SessionView};
use crate::ingest::reader::{drop_foreign_summaries, gate_resumed};
use crate::ingest::record::Record;

/// A send waiting for the running child to finish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub text: String,
    pub queued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(text: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            queued_at: Utc::now(),
        }
    }
}

/// In-memory model of one session
pub struct SessionState {
    pub session_id: String,
    pub agent_id: String,
    pub log_path: PathBuf,
    pub view: SessionView,
    /// Optimistic messages not yet observed in the log
    pub pending: Vec<Message>,
    pub queue: Vec<QueuedMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_viewed: Option<DateTime<Utc>>,
    /// Wall clock of the most recent dispatch through this session
    pub last_send_time: Option<DateTime<Utc>>,
    pub plan_file_path: Option<PathBuf>,
}

impl SessionState {
    pub fn new(session_id: &str, agent_id: &str, log_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            log_path,
            view: SessionView::new(),
            pending: Vec::new(),
            queue: Vec::new(),
            created_at: now,
            updated_at: now,
            last_viewed: None,
            last_send_time: None,
            plan_file_path: None,
        }
    }

    /// Fold freshly polled records, applying the resume gate and dropping
    /// cross-session summaries. Returns whether the visible state changed.
    pub fn ingest(&mut self, records: Vec<Record>) -> bool {
        if records.is_empty() {
            return false;
        }
        let known: HashSet<String> = self.view.known_uuids().clone();
        // A summary may back-reference a record arriving in the same batch
        let mut session_uuids = known.clone();
        for record in &records {
            if let Some(uuid) = record.uuid() {
                session_uuids.insert(uuid.to_string());
            }
        }
        let records = drop_foreign_summaries(records, &session_uuids);
        let records = gate_resumed(records, self.last_send_time, &known);

        let mut changed = false;
        for record in &records {
            if self.view.apply(record) {
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
            self.reconcile_pending();
        }
        changed
    }

    /// Replace the whole view (cache reload)
    pub fn rebuild(&mut self, records: Vec<Record>) {
        let session_uuids: HashSet<String> = records
            .iter()
            .filter_map(|r| r.uuid().map(|u| u.to_string()))
            .collect();
        let records = drop_foreign_summaries(records, &session_uuids);

        self.view = SessionView::new();
        for record in &records {
            self.view.apply(record);
        }
        self.updated_at = Utc::now();
        self.reconcile_pending();
    }

    /// Drop optimistic messages whose text has appeared in the log
    fn reconcile_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let landed: Vec<String> = self
            .pending
            .iter()
            .filter(|pending| {
                self.view
                    .messages()
                    .any(|m| m.kind == pending.kind && m.content == pending.content)
            })
            .map(|m| m.uuid.clone())
            .collect();
        self.pending.retain(|m| !landed.contains(&m.uuid));
    }

    /// Record an optimistic user message for a dispatched send
    pub fn push_pending(&mut self, text: &str) -> String {
        let uuid = format!("pending-{}", Uuid::new_v4());
        self.pending
            .push(Message::pending_user(&uuid, text, Utc::now()));
        uuid
    }

    /// Flag an optimistic message as failed, preserving its text for re-send
    pub fn mark_failed(&mut self, pending_uuid: &str) {
        if let Some(msg) = self.pending.iter_mut().find(|m| m.uuid == pending_uuid) {
            msg.is_pending = false;
            msg.is_failed = true;
        }
    }

    pub fn unread_count(&self) -> usize {
        self.view.unread_count(self.last_viewed)
    }

    pub fn preview(&self) -> String {
        self.view.preview().unwrap_or_default().to_string()
    }

    /// Paged read from the tail; the newest page also carries the optimistic
    /// messages so a just-sent prompt is visible immediately
    pub fn page(&self, limit: usize, offset: usize) -> Vec<Message> {
        let mut out = self.view.page_from_tail(limit, offset);
        if offset == 0 {
            out.extend(self.pending.iter().cloned());
        }
        out
    }

    /// Displayable messages for the `session:messages` event
    pub fn visible_messages(&self) -> Vec<Message> {
        let mut out: Vec<Message> = self
            .view
            .messages()
            .filter(|m| m.is_displayable())
            .cloned()
            .collect();
        out.extend(self.pending.iter().cloned());
        out
    }

    /// Event payload summarizing this session
    pub fn summary_payload(&self) -> serde_json::Value {
        json!({
            "sessionId": self.session_id,
            "agentId": self.agent_id,
            "preview": self.preview(),
            "unreadCount": self.unread_count(),
            "updatedAt": self.updated_at.to_rfc3339(),
            "queuedCount": self.queue.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::MessageKind;
    use crate::ingest::record::parse_line;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn user_record(uuid: &str, text: &str, ts: &str) -> Record {
        parse_line(
            &json!({
                "type": "user", "uuid": uuid, "timestamp": ts,
                "message": {"role": "user", "content": text}
            })
            .to_string(),
        )
        .unwrap()
        .unwrap()
    }

    fn state() -> SessionState {
        SessionState::new("s-1", "a-1", PathBuf::from("/logs/s-1.jsonl"))
    }

    #[test]
    fn ingest_folds_and_updates_preview() {
        let mut state = state();
        let changed = state.ingest(vec![user_record("u-1", "hello", "2025-06-01T10:00:00Z")]);
        assert!(changed);
        assert_eq!(state.preview(), "hello");
    }

    #[test]
    fn pending_message_clears_when_log_catches_up() {
        let mut state = state();
        state.push_pending("hello");
        assert_eq!(state.page(10, 0).len(), 1);
        assert!(state.page(10, 0)[0].is_pending);

        state.ingest(vec![user_record("u-1", "hello", "2025-06-01T10:00:00Z")]);
        let page = state.page(10, 0);
        assert_eq!(page.len(), 1);
        assert!(!page[0].is_pending);
        assert_eq!(page[0].kind, MessageKind::User);
    }

    #[test]
    fn failed_send_preserves_text() {
        let mut state = state();
        let uuid = state.push_pending("do the thing");
        state.mark_failed(&uuid);

        let page = state.page(10, 0);
        assert_eq!(page.len(), 1);
        assert!(page[0].is_failed);
        assert!(!page[0].is_pending);
        assert_eq!(page[0].content, "do the thing");
    }

    #[test]
    fn resume_gate_uses_last_send_time() {
        let mut state = state();
        state.ingest(vec![user_record("u-1", "old", "2025-06-01T09:00:00Z")]);
        state.last_send_time = Some("2025-06-01T10:00:00Z".parse().unwrap());

        // A resumed child re-emits the historical record with its old
        // timestamp; the view must not change.
        let before = state.view.len();
        let changed = state.ingest(vec![user_record("u-1", "old", "2025-06-01T09:00:00Z")]);
        assert!(!changed);
        assert_eq!(state.view.len(), before);
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let mut state = state();
        state.queue.push(QueuedMessage::new("first"));
        state.queue.push(QueuedMessage::new("second"));
        assert_eq!(state.queue[0].text, "first");

        let next = state.queue.remove(0);
        assert_eq!(next.text, "first");
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn rebuild_replaces_view() {
        let mut state = state();
        state.ingest(vec![user_record("u-1", "one", "2025-06-01T10:00:00Z")]);
        state.rebuild(vec![user_record("u-2", "two", "2025-06-01T10:00:01Z")]);
        assert_eq!(state.view.len(), 1);
        assert_eq!(state.preview(), "two");
    }
}
