//! Instant session creation
//!
//! A session exists the moment its log file does; no child is spawned. The
//! bootstrap writes a conforming three-record prefix (file-history-snapshot,
//! starter user record, starter assistant record) and registers the session
//! in the folder's index. The assistant record's `content` must be a block
//! array: the resume parser downstream rejects a plain string there.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::path::Path;
use uuid::Uuid;

use crate::ingest::paths::{mtime_ms, LogLayout, SessionsIndex};

/// Text of the starter user record
pub const STARTER_USER_TEXT: &str = "Starting a new session.";

/// Text of the starter assistant record
pub const STARTER_ASSISTANT_TEXT: &str =
    "I'm ready for action. What would you like me to do?";

/// A freshly bootstrapped session
#[derive(Debug, Clone)]
pub struct BootstrappedSession {
    pub session_id: String,
    pub log_path: std::path::PathBuf,
}

/// Create a new session for `folder` by writing its log prefix
pub async fn create_session(layout: &LogLayout, folder: &Path) -> Result<BootstrappedSession> {
    let session_id = Uuid::new_v4().to_string();
    let log_path = layout.session_log(folder, &session_id);
    let parent = log_path
        .parent()
        .context("Session log path has no parent")?;
    tokio::fs::create_dir_all(parent).await?;

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let snapshot_id = Uuid::new_v4().to_string();
    let user_uuid = Uuid::new_v4().to_string();
    let assistant_uuid = Uuid::new_v4().to_string();

    let snapshot = json!({
        "type": "file-history-snapshot",
        "messageId": snapshot_id,
        "snapshot": {"files": []},
        "isSnapshotUpdate": false,
        "timestamp": now,
    });
    let user = json!({
        "type": "user",
        "uuid": user_uuid,
        "parentUuid": null,
        "sessionId": session_id,
        "timestamp": now,
        "message": {"role": "user", "content": STARTER_USER_TEXT},
    });
    let assistant = json!({
        "type": "assistant",
        "uuid": assistant_uuid,
        "parentUuid": user_uuid,
        "sessionId": session_id,
        "timestamp": now,
        "message": {
            "role": "assistant",
            "content": [{"type": "text", "text": STARTER_ASSISTANT_TEXT}],
        },
    });

    let body = format!("{}\n{}\n{}\n", snapshot, user, assistant);
    tokio::fs::write(&log_path, &body)
        .await
        .with_context(|| format!("Failed to write '{}'", log_path.display()))?;

    let index_path = layout.index_file(folder);
    let mut index = SessionsIndex::load(&index_path).await?;
    index.upsert(&session_id, mtime_ms(&log_path)?);
    index.save(&index_path).await?;

    tracing::info!(session = %session_id, folder = %folder.display(), "bootstrapped session");
    Ok(BootstrappedSession {
        session_id,
        log_path,
    })
}
