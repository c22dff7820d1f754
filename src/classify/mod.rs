//! Classifier: folds log records into view-level message state
//!
//! Classification is a pure fold. Each record produces zero or one
//! [`Message`] plus side effects on the tool index (`tool_use_id` -> carrying
//! message). The resulting message list is a displayable, order-preserving
//! subsequence of the record stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::ingest::record::{ContentBlock, Record, UserRecord};
use crate::ingest::FIFO_CAP;

/// Marker the child writes when a response is interrupted mid-flight
pub const INTERRUPT_MARKER: &str = "[Request interrupted by user";

/// Leading markers of metadata-only user records (slash commands, local
/// command output, caveat wrappers)
const META_MARKERS: &[&str] = &[
    "<command-name>",
    "<command-message>",
    "<command-args>",
    "<local-command-stdout>",
    "<local-command-stderr>",
    "Caveat: The messages below were generated",
];

/// Tool name of the blocking question rendezvous
const ASK_USER_QUESTION: &str = "AskUserQuestion";

/// View-level message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    /// Ordering placeholder for a tool result; filtered from display
    ToolResultCarrier,
    Compaction,
    /// Core-authored markers such as "response interrupted"
    System,
}

/// Result attached to a tool_use block once its tool_result arrives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub content: Value,
    pub is_error: bool,
}

/// View-level content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<ToolOutcome>,
    },
    Image {
        source: Value,
    },
}

/// A question the child could not render itself, awaiting the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub tool_use_id: String,
    pub questions: Value,
}

/// View-level message derived from one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub kind: MessageKind,
    pub uuid: String,
    pub blocks: Vec<Block>,
    /// Plain text preview of the content
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_compaction: bool,
    #[serde(default)]
    pub is_pending: bool,
    #[serde(default)]
    pub is_failed: bool,
    #[serde(default)]
    pub is_synthetic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<PendingQuestion>,
}

impl Message {
    fn new(kind: MessageKind, uuid: &str, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            kind,
            uuid: uuid.to_string(),
            blocks: Vec::new(),
            content: String::new(),
            timestamp,
            is_compaction: false,
            is_pending: false,
            is_failed: false,
            is_synthetic: false,
            pending_question: None,
        }
    }

    /// An optimistic user message not yet observed in the log
    pub fn pending_user(uuid: &str, text: &str, timestamp: DateTime<Utc>) -> Self {
        let mut msg = Self::new(MessageKind::User, uuid, Some(timestamp));
        msg.content = text.to_string();
        msg.blocks.push(Block::Text {
            text: text.to_string(),
        });
        msg.is_pending = true;
        msg
    }

    /// Whether the default view renders this message
    pub fn is_displayable(&self) -> bool {
        self.kind != MessageKind::ToolResultCarrier && !self.is_synthetic
    }
}

#[derive(Debug, Clone)]
struct ToolUseRef {
    message_uuid: String,
    name: String,
    input: Value,
}

/// Per-session fold state: ordered messages plus the tool_use index
#[derive(Debug, Default)]
pub struct SessionView {
    messages: VecDeque<Message>,
    tool_index: HashMap<String, ToolUseRef>,
    /// Record uuids observed, kept past the FIFO cap for gating and
    /// cross-session summary checks
    seen_uuids: HashSet<String>,
    /// Dedup keys of records already folded
    applied_keys: HashSet<String>,
    cap: usize,
}

impl SessionView {
    pub fn new() -> Self {
        Self {
            cap: FIFO_CAP,
            ..Default::default()
        }
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap,
            ..Default::default()
        }
    }

    /// Build a view from a full record slice
    pub fn build(records: &[Record]) -> Self {
        let mut view = Self::new();
        for record in records {
            view.apply(record);
        }
        view
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Uuids of every message currently held (including carriers)
    pub fn known_uuids(&self) -> &HashSet<String> {
        &self.seen_uuids
    }

    /// Plain-text preview from the newest displayable message
    pub fn preview(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_displayable() && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }

    /// Paged read from the tail: `offset` messages back, at most `limit`
    pub fn page_from_tail(&self, limit: usize, offset: usize) -> Vec<Message> {
        let total = self.messages.len();
        let end = total.saturating_sub(offset);
        let start = end.saturating_sub(limit);
        self.messages.range(start..end).cloned().collect()
    }

    /// Count of assistant messages newer than `last_viewed`
    pub fn unread_count(&self, last_viewed: Option<DateTime<Utc>>) -> usize {
        self.messages
            .iter()
            .filter(|m| m.kind == MessageKind::Assistant && !m.is_synthetic)
            .filter(|m| match (m.timestamp, last_viewed) {
                (Some(ts), Some(viewed)) => ts > viewed,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .count()
    }

    /// Fold one record into the view. Returns `true` when the visible state
    /// changed.
    pub fn apply(&mut self, record: &Record) -> bool {
        if let Some(key) = record.dedup_key() {
            if self.applied_keys.contains(&key) {
                return false;
            }
            self.applied_keys.insert(key);
        }
        if let Some(uuid) = record.uuid() {
            self.seen_uuids.insert(uuid.to_string());
        }

        let changed = match record {
            Record::User(user) => self.apply_user(user, record.timestamp()),
            Record::Assistant(assistant) => {
                let ts = record.timestamp();
                let mut msg = Message::new(MessageKind::Assistant, &assistant.uuid, ts);
                msg.is_synthetic = assistant.is_synthetic();
                msg.content = assistant.message.content.plain_text();
                for block in assistant.message.content.blocks() {
                    match block {
                        ContentBlock::Text { text } => {
                            msg.blocks.push(Block::Text { text: text.clone() })
                        }
                        ContentBlock::Thinking { thinking, .. } => msg.blocks.push(Block::Thinking {
                            thinking: thinking.clone(),
                        }),
                        ContentBlock::ToolUse { id, name, input } => {
                            self.tool_index.insert(
                                id.clone(),
                                ToolUseRef {
                                    message_uuid: assistant.uuid.clone(),
                                    name: name.clone(),
                                    input: input.clone(),
                                },
                            );
                            msg.blocks.push(Block::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                                result: None,
                            });
                        }
                        ContentBlock::Image { source } => msg.blocks.push(Block::Image {
                            source: source.clone(),
                        }),
                        ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
                    }
                }
                self.push(msg);
                true
            }
            Record::Summary(summary) => {
                let uuid = match &summary.leaf_uuid {
                    Some(leaf) => format!("summary-{}", leaf),
                    None => format!("summary-{}", self.messages.len()),
                };
                let mut msg = Message::new(MessageKind::Compaction, &uuid, None);
                msg.is_compaction = true;
                msg.content = summary.summary.clone();
                self.push(msg);
                true
            }
            Record::System(_) | Record::FileHistorySnapshot(_) | Record::Unknown => false,
        };
        changed
    }

    fn apply_user(&mut self, user: &UserRecord, ts: Option<DateTime<Utc>>) -> bool {
        let text = user.message.content.plain_text();

        // Compaction summaries are meta records that must still surface
        if user.is_compact_summary {
            let mut msg = Message::new(MessageKind::Compaction, &user.uuid, ts);
            msg.is_compaction = true;
            msg.content = compaction_preview(&text).to_string();
            self.push(msg);
            return true;
        }

        // Tool results attach to their tool_use and leave a hidden carrier
        // in the stream so ordering stays stable.
        let results: Vec<&ContentBlock> = user
            .message
            .content
            .blocks()
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
            .collect();
        if !results.is_empty() {
            for block in results {
                let ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } = block
                else {
                    continue;
                };
                self.attach_result(tool_use_id, content, *is_error);
            }
            let msg = Message::new(MessageKind::ToolResultCarrier, &user.uuid, ts);
            self.push(msg);
            return true;
        }

        if user.is_meta || META_MARKERS.iter().any(|m| text.trim_start().starts_with(m)) {
            return false;
        }

        if text.trim_start().starts_with(INTERRUPT_MARKER) {
            let mut msg = Message::new(MessageKind::System, &user.uuid, ts);
            msg.content = "Response interrupted".to_string();
            self.push(msg);
            return true;
        }

        if text.trim().is_empty() {
            return false;
        }

        let mut msg = Message::new(MessageKind::User, &user.uuid, ts);
        msg.content = text.clone();
        msg.blocks.push(Block::Text { text });
        for block in user.message.content.blocks() {
            if let ContentBlock::Image { source } = block {
                msg.blocks.push(Block::Image {
                    source: source.clone(),
                });
            }
        }
        self.push(msg);
        true
    }

    fn attach_result(&mut self, tool_use_id: &str, content: &Value, is_error: bool) {
        let Some(tool_ref) = self.tool_index.get(tool_use_id).cloned() else {
            tracing::debug!(tool_use_id, "tool_result without a matching tool_use");
            return;
        };
        let Some(msg) = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.uuid == tool_ref.message_uuid)
        else {
            return;
        };

        let mut question_pos = None;
        for (pos, block) in msg.blocks.iter_mut().enumerate() {
            let Block::ToolUse { id, result, .. } = block else {
                continue;
            };
            if id != tool_use_id {
                continue;
            }
            *result = Some(ToolOutcome {
                content: content.clone(),
                is_error,
            });
            if is_error && is_ask_user_question(&tool_ref.name) {
                question_pos = Some(pos);
            }
            break;
        }

        // A failed AskUserQuestion means the child could not render the
        // question itself. Surface it and hide everything past it.
        if let Some(pos) = question_pos {
            msg.pending_question = Some(PendingQuestion {
                tool_use_id: tool_use_id.to_string(),
                questions: tool_ref
                    .input
                    .get("questions")
                    .cloned()
                    .unwrap_or_else(|| tool_ref.input.clone()),
            });
            msg.blocks.truncate(pos + 1);
        }
    }

    fn push(&mut self, msg: Message) {
        self.messages.push_back(msg);
        while self.messages.len() > self.cap {
            if let Some(dropped) = self.messages.pop_front() {
                tracing::trace!(uuid = %dropped.uuid, "dropping message past FIFO cap");
            }
        }
    }
}

fn is_ask_user_question(name: &str) -> bool {
    name == ASK_USER_QUESTION || name.ends_with(&format!("__{}", ASK_USER_QUESTION))
}

/// First line of a compaction summary, for session previews
fn compaction_preview(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::record::parse_line;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn user(uuid: &str, text: &str, ts: &str) -> Record {
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

    fn assistant_text(uuid: &str, text: &str, ts: &str) -> Record {
        parse_line(
            &json!({
                "type": "assistant", "uuid": uuid, "timestamp": ts,
                "message": {"role": "assistant", "model": "claude-sonnet-4",
                            "content": [{"type": "text", "text": text}]}
            })
            .to_string(),
        )
        .unwrap()
        .unwrap()
    }

    fn assistant_tool_use(uuid: &str, tool_id: &str, name: &str, input: Value, ts: &str) -> Record {
        parse_line(
            &json!({
                "type": "assistant", "uuid": uuid, "timestamp": ts,
                "message": {"role": "assistant", "model": "claude-sonnet-4", "content": [
                    {"type": "text", "text": "working"},
                    {"type": "tool_use", "id": tool_id, "name": name, "input": input}
                ]}
            })
            .to_string(),
        )
        .unwrap()
        .unwrap()
    }

    fn tool_result(uuid: &str, tool_id: &str, content: &str, is_error: bool, ts: &str) -> Record {
        parse_line(
            &json!({
                "type": "user", "uuid": uuid, "timestamp": ts,
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": tool_id,
                     "content": content, "is_error": is_error}
                ]}
            })
            .to_string(),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn user_and_assistant_fold_in_order() {
        let view = SessionView::build(&[
            user("u-1", "hello", "2025-06-01T10:00:00Z"),
            assistant_text("a-1", "hi there", "2025-06-01T10:00:05Z"),
        ]);

        let kinds: Vec<MessageKind> = view.messages().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::User, MessageKind::Assistant]);
        assert_eq!(view.preview(), Some("hi there"));
    }

    #[test]
    fn meta_records_are_filtered() {
        let view = SessionView::build(&[
            user("u-1", "<command-name>/status</command-name>", "2025-06-01T10:00:00Z"),
            user("u-2", "<local-command-stdout>ok</local-command-stdout>", "2025-06-01T10:00:01Z"),
            user("u-3", "real message", "2025-06-01T10:00:02Z"),
        ]);
        assert_eq!(view.len(), 1);
        assert_eq!(view.preview(), Some("real message"));
    }

    #[test]
    fn interrupt_marker_becomes_system_message() {
        let view = SessionView::build(&[user(
            "u-1",
            "[Request interrupted by user]",
            "2025-06-01T10:00:00Z",
        )]);
        let msg = view.messages().next().unwrap();
        assert_eq!(msg.kind, MessageKind::System);
        assert_eq!(msg.content, "Response interrupted");
    }

    #[test]
    fn tool_result_attaches_and_never_stands_alone() {
        let view = SessionView::build(&[
            assistant_tool_use(
                "a-1",
                "t-1",
                "Bash",
                json!({"command": "ls"}),
                "2025-06-01T10:00:00Z",
            ),
            tool_result("u-2", "t-1", "file.txt", false, "2025-06-01T10:00:01Z"),
        ]);

        // Carrier stays in the stream for ordering but is not displayable
        assert_eq!(view.len(), 2);
        let carrier = view.messages().nth(1).unwrap();
        assert_eq!(carrier.kind, MessageKind::ToolResultCarrier);
        assert!(!carrier.is_displayable());

        let assistant = view.messages().next().unwrap();
        let Block::ToolUse { result, .. } = &assistant.blocks[1] else {
            panic!("expected tool_use block");
        };
        assert_eq!(result.as_ref().unwrap().content, json!("file.txt"));
        assert!(!result.as_ref().unwrap().is_error);
    }

    #[test]
    fn failed_question_surfaces_and_truncates() {
        let questions = json!({"questions": [{"question": "Proceed?", "options": ["A", "B"]}]});
        let mut records = vec![assistant_tool_use(
            "a-1",
            "u7",
            "AskUserQuestion",
            questions.clone(),
            "2025-06-01T10:00:00Z",
        )];
        // Give the assistant message a block after the question
        let Record::Assistant(rec) = &mut records[0] else {
            unreachable!()
        };
        if let crate::ingest::record::MessageContent::Blocks(blocks) = &mut rec.message.content {
            blocks.push(crate::ingest::record::ContentBlock::Text {
                text: "trailing".to_string(),
            });
        }
        records.push(tool_result(
            "u-2",
            "u7",
            "Answer questions?",
            true,
            "2025-06-01T10:00:01Z",
        ));

        let view = SessionView::build(&records);
        let msg = view.messages().next().unwrap();
        let pending = msg.pending_question.as_ref().unwrap();
        assert_eq!(pending.tool_use_id, "u7");
        assert_eq!(pending.questions, questions["questions"]);
        // Nothing past the unresolved question is rendered
        assert!(matches!(msg.blocks.last(), Some(Block::ToolUse { .. })));
    }

    #[test]
    fn mcp_prefixed_question_tool_is_recognized() {
        let view = SessionView::build(&[
            assistant_tool_use(
                "a-1",
                "t-9",
                "mcp__claudefu__AskUserQuestion",
                json!({"questions": []}),
                "2025-06-01T10:00:00Z",
            ),
            tool_result("u-2", "t-9", "err", true, "2025-06-01T10:00:01Z"),
        ]);
        assert!(view.messages().next().unwrap().pending_question.is_some());
    }

    #[test]
    fn synthetic_assistant_is_flagged_and_hidden() {
        let record = parse_line(
            &json!({
                "type": "assistant", "uuid": "a-9", "timestamp": "2025-06-01T10:00:00Z",
                "message": {"role": "assistant", "model": "<synthetic>",
                            "content": [{"type": "text", "text": "synthetic"}]}
            })
            .to_string(),
        )
        .unwrap()
        .unwrap();

        let view = SessionView::build(&[record]);
        let msg = view.messages().next().unwrap();
        assert!(msg.is_synthetic);
        assert!(!msg.is_displayable());
    }

    #[test]
    fn compaction_summary_surfaces() {
        let record = parse_line(
            &json!({
                "type": "user", "uuid": "u-1", "timestamp": "2025-06-01T10:00:00Z",
                "isCompactSummary": true,
                "message": {"role": "user",
                            "content": "This session is being continued from a previous conversation.\nDetails follow."}
            })
            .to_string(),
        )
        .unwrap()
        .unwrap();

        let view = SessionView::build(&[record]);
        let msg = view.messages().next().unwrap();
        assert_eq!(msg.kind, MessageKind::Compaction);
        assert!(msg.is_compaction);
        assert_eq!(
            msg.content,
            "This session is being continued from a previous conversation."
        );
    }

    #[test]
    fn unread_counts_assistant_after_last_viewed() {
        let view = SessionView::build(&[
            assistant_text("a-1", "first", "2025-06-01T10:00:00Z"),
            user("u-1", "hi", "2025-06-01T10:00:01Z"),
            assistant_text("a-2", "second", "2025-06-01T10:00:02Z"),
        ]);

        assert_eq!(view.unread_count(None), 2);
        let viewed = "2025-06-01T10:00:01Z".parse().unwrap();
        assert_eq!(view.unread_count(Some(viewed)), 1);
        let later = "2025-06-01T10:00:03Z".parse().unwrap();
        assert_eq!(view.unread_count(Some(later)), 0);
    }

    #[test]
    fn fifo_cap_drops_from_head() {
        let mut view = SessionView::with_cap(2);
        view.apply(&user("u-1", "one", "2025-06-01T10:00:00Z"));
        view.apply(&user("u-2", "two", "2025-06-01T10:00:01Z"));
        view.apply(&user("u-3", "three", "2025-06-01T10:00:02Z"));

        let uuids: Vec<&str> = view.messages().map(|m| m.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["u-2", "u-3"]);
    }

    #[test]
    fn paged_get_reads_from_tail() {
        let records: Vec<Record> = (0..5)
            .map(|i| user(&format!("u-{}", i), "x", "2025-06-01T10:00:00Z"))
            .collect();
        let view = SessionView::build(&records);

        let page = view.page_from_tail(2, 1);
        let uuids: Vec<&str> = page.iter().map(|m| m.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["u-2", "u-3"]);
    }

    #[test]
    fn duplicate_record_does_not_change_state() {
        let record = user("u-1", "hello", "2025-06-01T10:00:00Z");
        let mut view = SessionView::new();
        assert!(view.apply(&record));
        assert!(!view.apply(&record));
        assert_eq!(view.len(), 1);
    }
}
