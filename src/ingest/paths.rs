//! Deterministic log locations and the per-folder sessions index

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::utils::fs::write_atomic;

/// Name of the per-folder sessions index file
pub const SESSIONS_INDEX: &str = "sessions-index.json";

/// Maps project folders to their session log directory
#[derive(Debug, Clone)]
pub struct LogLayout {
    root: PathBuf,
}

impl LogLayout {
    /// Layout rooted at the assistant's default log root (`~/.claude/projects`)
    pub fn default_root() -> Result<Self> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self {
            root: home.join(".claude").join("projects"),
        })
    }

    /// Layout with an explicit root, used by tests and custom installs
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all session logs for `folder`
    pub fn project_dir(&self, folder: &Path) -> PathBuf {
        self.root.join(encode_folder(folder))
    }

    /// Log file for one session
    pub fn session_log(&self, folder: &Path, session_id: &str) -> PathBuf {
        self.project_dir(folder).join(format!("{}.jsonl", session_id))
    }

    /// Sessions index file for `folder`
    pub fn index_file(&self, folder: &Path) -> PathBuf {
        self.project_dir(folder).join(SESSIONS_INDEX)
    }

    /// Session ids present on disk for `folder`, from `*.jsonl` file names
    pub fn scan_sessions(&self, folder: &Path) -> Vec<String> {
        let dir = self.project_dir(folder);
        let mut ids = Vec::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return ids;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids
    }
}

/// Folder path encoding used by the log directory layout: every character
/// outside `[A-Za-z0-9]` becomes `-`, so `/Users/me/app.web` maps to
/// `-Users-me-app-web`.
pub fn encode_folder(folder: &Path) -> String {
    folder
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// One entry of the sessions index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub version: i64,
    pub file_mtime: i64,
}

/// The per-folder sessions index: session id -> entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionsIndex {
    #[serde(default)]
    pub sessions: BTreeMap<String, IndexEntry>,
}

impl SessionsIndex {
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                serde_json::from_str(&contents).context("Failed to parse sessions index")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).context("Failed to read sessions index"),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        write_atomic(path, &contents).await
    }

    /// Record a session, bumping `version` when it already exists
    pub fn upsert(&mut self, session_id: &str, file_mtime_ms: i64) {
        match self.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.version += 1;
                entry.file_mtime = file_mtime_ms;
            }
            None => {
                self.sessions.insert(
                    session_id.to_string(),
                    IndexEntry {
                        version: 1,
                        file_mtime: file_mtime_ms,
                    },
                );
            }
        }
    }
}

/// File modification time in integer milliseconds
pub fn mtime_ms(path: &Path) -> Result<i64> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat '{}'", path.display()))?;
    let mtime = meta.modified()?;
    let ms = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    Ok(ms)
}
