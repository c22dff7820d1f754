//! Failed-question log patch
//!
//! When a child runs in the non-interactive mode, its built-in question tool
//! writes a `tool_result` with `is_error: true` and exits. Answering later
//! means rewriting that one line: flip `is_error` to `false` and substitute
//! the user's answers. This is the only place the core mutates a log line it
//! did not author. Callers must pause the fine watcher first and clear the
//! reader cache afterwards; see `Orchestrator::answer_question`.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock held while a log file is rewritten
struct PatchLock {
    path: PathBuf,
}

impl PatchLock {
    fn acquire(log_path: &Path) -> Result<Self> {
        let path = log_path.with_extension("jsonl.patch-lock");
        // create_new gives O_EXCL semantics; a leftover lock means another
        // patch is in flight (or crashed mid-write).
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Log '{}' is locked for patching", log_path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for PatchLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Rewrite the failed `tool_result` for `tool_use_id` with the user's answers.
///
/// Returns `true` when a line was rewritten, `false` when no matching failed
/// result exists. The patch operates on raw JSON values so fields the core
/// does not model survive untouched.
pub fn apply_question_patch(log_path: &Path, tool_use_id: &str, answers: &Value) -> Result<bool> {
    let _lock = PatchLock::acquire(log_path)?;

    let contents = std::fs::read_to_string(log_path)
        .with_context(|| format!("Failed to read '{}'", log_path.display()))?;

    let mut patched = false;
    let mut lines: Vec<String> = Vec::new();

    for line in contents.lines() {
        if patched || line.trim().is_empty() {
            lines.push(line.to_string());
            continue;
        }
        let Ok(mut value) = serde_json::from_str::<Value>(line) else {
            lines.push(line.to_string());
            continue;
        };

        if rewrite_failed_result(&mut value, tool_use_id, answers) {
            lines.push(serde_json::to_string(&value)?);
            patched = true;
        } else {
            lines.push(line.to_string());
        }
    }

    if !patched {
        return Ok(false);
    }

    let mut body = lines.join("\n");
    if contents.ends_with('\n') {
        body.push('\n');
    }

    let tmp = log_path.with_extension("jsonl.patch-tmp");
    std::fs::write(&tmp, &body)
        .with_context(|| format!("Failed to write '{}'", tmp.display()))?;
    std::fs::rename(&tmp, log_path)
        .with_context(|| format!("Failed to replace '{}'", log_path.display()))?;

    tracing::info!(path = %log_path.display(), tool_use_id, "patched failed question result");
    Ok(true)
}

fn rewrite_failed_result(record: &mut Value, tool_use_id: &str, answers: &Value) -> bool {
    if record.get("type").and_then(Value::as_str) != Some("user") {
        return false;
    }
    let Some(blocks) = record
        .get_mut("message")
        .and_then(|m| m.get_mut("content"))
        .and_then(Value::as_array_mut)
    else {
        return false;
    };

    let mut hit = false;
    for block in blocks {
        let is_match = block.get("type").and_then(Value::as_str) == Some("tool_result")
            && block.get("tool_use_id").and_then(Value::as_str) == Some(tool_use_id)
            && block.get("is_error").and_then(Value::as_bool) == Some(true);
        if !is_match {
            continue;
        }
        block["is_error"] = Value::Bool(false);
        block["content"] = render_answer_content(answers);
        hit = true;
        break;
    }

    if hit {
        record["toolUseResult"] = render_answer_content(answers);
    }
    hit
}

/// Answers render as the text the child would have produced on success
fn render_answer_content(answers: &Value) -> Value {
    match answers {
        Value::String(s) => Value::String(format!("User answered: {}", s)),
        Value::Object(map) => {
            let mut parts = Vec::new();
            for (question, answer) in map {
                let text = match answer {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                parts.push(format!("{}: {}", question, text));
            }
            Value::String(format!("User answered: {}", parts.join("; ")))
        }
        other => Value::String(format!("User answered: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::record::{parse_line, ContentBlock, MessageContent, Record};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn failed_question_log() -> String {
        let tool_use = json!({
            "type": "assistant",
            "uuid": "a-1",
            "timestamp": "2025-06-01T10:00:00Z",
            "message": {"role": "assistant", "model": "claude-sonnet-4", "content": [
                {"type": "tool_use", "id": "u7", "name": "AskUserQuestion",
                 "input": {"questions": [{"question": "Proceed?", "options": ["A", "B"]}]}}
            ]}
        });
        let failed_result = json!({
            "type": "user",
            "uuid": "u-2",
            "timestamp": "2025-06-01T10:00:01Z",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "u7",
                 "content": "Answer questions?", "is_error": true}
            ]},
            "toolUseResult": "Error: interactive prompt unavailable",
            "unmodeledField": {"keep": "me"}
        });
        format!("{}\n{}\n", tool_use, failed_result)
    }

    #[test]
    fn rewrites_failed_result_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, failed_question_log()).unwrap();

        let patched = apply_question_patch(&path, "u7", &json!({"q1": "A"})).unwrap();
        assert!(patched);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let Record::User(user) = parse_line(lines[1]).unwrap().unwrap() else {
            panic!("expected user record");
        };
        let MessageContent::Blocks(blocks) = &user.message.content else {
            panic!("expected block content");
        };
        let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = &blocks[0]
        else {
            panic!("expected tool_result block");
        };
        assert_eq!(tool_use_id, "u7");
        assert!(!is_error);
        assert!(content.as_str().unwrap().contains("A"));
        // Fields the schema does not model survive the rewrite
        assert_eq!(user.extra.get("unmodeledField"), Some(&json!({"keep": "me"})));
    }

    #[test]
    fn untouched_when_no_failed_result_matches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, failed_question_log()).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let patched = apply_question_patch(&path, "other-id", &json!({"q1": "A"})).unwrap();
        assert!(!patched);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn successful_results_are_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        let ok_result = json!({
            "type": "user",
            "uuid": "u-3",
            "timestamp": "2025-06-01T10:00:02Z",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "u7", "content": "done", "is_error": false}
            ]}
        });
        std::fs::write(&path, format!("{}\n", ok_result)).unwrap();

        assert!(!apply_question_patch(&path, "u7", &json!({"q1": "A"})).unwrap());
    }

    #[test]
    fn lock_file_is_released_after_patch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, failed_question_log()).unwrap();

        apply_question_patch(&path, "u7", &json!("yes")).unwrap();
        apply_question_patch(&path, "u7", &json!("yes")).unwrap();
    }
}
