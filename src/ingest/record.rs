//! Log record schema
//!
//! One line of a session log parses into exactly one [`Record`]. Unknown
//! record types and unknown fields are tolerated: the writer's format gains
//! fields faster than consumers adopt them, so every struct keeps a flattened
//! `extra` map and the union has an `Unknown` fallback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Model tag marking assistant records the child fabricated locally
pub const SYNTHETIC_MODEL: &str = "<synthetic>";

/// One line of the session log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Record {
    User(UserRecord),
    Assistant(AssistantRecord),
    System(SystemRecord),
    Summary(SummaryRecord),
    FileHistorySnapshot(SnapshotRecord),
    #[serde(other)]
    Unknown,
}

impl Record {
    /// Record uuid, when the record kind carries one. Summary records have no
    /// uuid of their own; their `leafUuid` is a back-pointer, not an identity.
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Record::User(r) => Some(&r.uuid),
            Record::Assistant(r) => Some(&r.uuid),
            Record::System(r) => r.uuid.as_deref(),
            Record::Summary(_) | Record::FileHistorySnapshot(_) | Record::Unknown => None,
        }
    }

    /// Key used for per-session deduplication. Summaries are keyed by their
    /// back-pointer so a repeated summary line is still a no-op without
    /// colliding with the record it points at.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            Record::Summary(r) => r.leaf_uuid.as_ref().map(|leaf| format!("summary:{}", leaf)),
            other => other.uuid().map(|u| u.to_string()),
        }
    }

    pub fn parent_uuid(&self) -> Option<&str> {
        match self {
            Record::User(r) => r.parent_uuid.as_deref(),
            Record::Assistant(r) => r.parent_uuid.as_deref(),
            Record::System(r) => r.parent_uuid.as_deref(),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Record::User(r) => r.session_id.as_deref(),
            Record::Assistant(r) => r.session_id.as_deref(),
            Record::System(r) => r.session_id.as_deref(),
            _ => None,
        }
    }

    /// Wall-clock timestamp parsed from the record's RFC 3339 field
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = match self {
            Record::User(r) => Some(r.timestamp.as_str()),
            Record::Assistant(r) => Some(r.timestamp.as_str()),
            Record::System(r) => r.timestamp.as_deref(),
            _ => None,
        }?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// A `user` record: human input, tool results, or local command metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub uuid: String,
    #[serde(default)]
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub timestamp: String,
    pub message: MessageEnvelope,
    #[serde(default)]
    pub is_meta: bool,
    #[serde(default)]
    pub is_compact_summary: bool,
    /// Either a plain string or a structured map; preserved verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_result: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An `assistant` record: model output with ordered content blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRecord {
    pub uuid: String,
    #[serde(default)]
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub timestamp: String,
    pub message: MessageEnvelope,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssistantRecord {
    pub fn is_synthetic(&self) -> bool {
        self.message.model.as_deref() == Some(SYNTHETIC_MODEL)
    }
}

/// A `system` record: child-side status lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRecord {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A `summary` record: compaction back-pointer into the conversation chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRecord {
    pub summary: String,
    #[serde(default)]
    pub leaf_uuid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A `file-history-snapshot` record, written once at session start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub message_id: String,
    #[serde(default)]
    pub snapshot: Value,
    #[serde(default)]
    pub is_snapshot_update: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `message` object shared by user and assistant records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub role: String,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message content arrives as a bare string or an array of blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated plain text of the content, for previews
    pub fn plain_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    if let ContentBlock::Text { text } = block {
                        parts.push(text.as_str());
                    }
                }
                parts.join("\n")
            }
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }
}

/// One element of a message content array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        source: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Parse one log line. Empty lines yield `None`; malformed lines are an error
/// the caller decides how to handle.
pub fn parse_line(line: &str) -> Result<Option<Record>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn user_line() -> String {
        json!({
            "type": "user",
            "uuid": "u-1",
            "parentUuid": null,
            "sessionId": "s-1",
            "timestamp": "2025-06-01T10:00:00.000Z",
            "message": {"role": "user", "content": "hello"},
            "cwd": "/p"
        })
        .to_string()
    }

    #[test]
    fn parses_user_record() {
        let record = parse_line(&user_line()).unwrap().unwrap();
        let Record::User(user) = &record else {
            panic!("expected user record");
        };
        assert_eq!(user.uuid, "u-1");
        assert_eq!(user.message.content.plain_text(), "hello");
        // Unknown fields survive in the extra map
        assert_eq!(user.extra.get("cwd"), Some(&json!("/p")));
        assert!(record.timestamp().is_some());
    }

    #[test]
    fn reparse_yields_equal_record() {
        let first = parse_line(&user_line()).unwrap().unwrap();
        let second = parse_line(&user_line()).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn parses_assistant_blocks_in_order() {
        let line = json!({
            "type": "assistant",
            "uuid": "a-1",
            "parentUuid": "u-1",
            "sessionId": "s-1",
            "timestamp": "2025-06-01T10:00:05.000Z",
            "message": {
                "role": "assistant",
                "model": "claude-sonnet-4",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "done"},
                    {"type": "tool_use", "id": "t-1", "name": "Bash", "input": {"command": "ls"}}
                ]
            }
        })
        .to_string();

        let Record::Assistant(rec) = parse_line(&line).unwrap().unwrap() else {
            panic!("expected assistant record");
        };
        let blocks = rec.message.content.blocks();
        assert_eq!(blocks.len(), 3);
        assert!(matches!(blocks[0], ContentBlock::Thinking { .. }));
        assert!(matches!(blocks[2], ContentBlock::ToolUse { .. }));
        assert!(!rec.is_synthetic());
    }

    #[test]
    fn synthetic_model_is_flagged() {
        let line = json!({
            "type": "assistant",
            "uuid": "a-2",
            "timestamp": "2025-06-01T10:00:06.000Z",
            "message": {"role": "assistant", "model": "<synthetic>", "content": "noop"}
        })
        .to_string();

        let Record::Assistant(rec) = parse_line(&line).unwrap().unwrap() else {
            panic!("expected assistant record");
        };
        assert!(rec.is_synthetic());
    }

    #[test]
    fn tool_use_result_accepts_string_and_object() {
        let as_string = json!({
            "type": "user",
            "uuid": "u-2",
            "timestamp": "2025-06-01T10:00:07.000Z",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t-1", "content": "ok", "is_error": false}
            ]},
            "toolUseResult": "plain text result"
        })
        .to_string();
        let as_object = json!({
            "type": "user",
            "uuid": "u-3",
            "timestamp": "2025-06-01T10:00:08.000Z",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t-2", "content": [], "is_error": false}
            ]},
            "toolUseResult": {"stdout": "ok", "interrupted": false}
        })
        .to_string();

        let Record::User(first) = parse_line(&as_string).unwrap().unwrap() else {
            panic!("expected user record");
        };
        let Record::User(second) = parse_line(&as_object).unwrap().unwrap() else {
            panic!("expected user record");
        };
        assert_eq!(first.tool_use_result, Some(json!("plain text result")));
        assert!(second.tool_use_result.as_ref().unwrap().is_object());
    }

    #[test]
    fn summary_and_snapshot_parse() {
        let summary = json!({"type": "summary", "summary": "Topic", "leafUuid": "u-9"}).to_string();
        let snapshot = json!({
            "type": "file-history-snapshot",
            "messageId": "m-1",
            "snapshot": {"files": []}
        })
        .to_string();

        assert!(matches!(
            parse_line(&summary).unwrap().unwrap(),
            Record::Summary(_)
        ));
        assert!(matches!(
            parse_line(&snapshot).unwrap().unwrap(),
            Record::FileHistorySnapshot(_)
        ));
    }

    #[test]
    fn unknown_type_falls_back() {
        let line = json!({"type": "queue-operation", "op": "push"}).to_string();
        assert!(matches!(
            parse_line(&line).unwrap().unwrap(),
            Record::Unknown
        ));
    }

    #[test]
    fn empty_line_is_none() {
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn malformed_line_is_error() {
        assert!(parse_line("{\"type\": \"user\", ").is_err());
    }
}
