//! Tailing reader over session log files
//!
//! The cache tracks one entry per attached log file: the byte offset consumed
//! so far and the set of record uuids already emitted. `poll` returns only
//! records not seen before, in file append order. A trailing line without a
//! newline (or one that fails to parse) is left unconsumed, since the writer
//! may be mid-append; the next notification retries it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::record::{parse_line, Record};
use crate::utils::error::ResultExt;

/// In-memory cap on messages per session; the log file stays authoritative
pub const FIFO_CAP: usize = 750;

/// Slack applied to the resume timestamp gate
const GATE_SLACK_SECS: i64 = 5;

#[derive(Debug, Default)]
struct CacheEntry {
    offset: u64,
    seen: HashSet<String>,
}

/// Per-file tailing state, keyed by log path
#[derive(Debug, Default)]
pub struct SessionLogCache {
    entries: DashMap<PathBuf, CacheEntry>,
}

impl SessionLogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to a log file and return its current tail, capped to the last
    /// `cap` records in file order. All uuids in the file are remembered so
    /// later polls never re-emit them.
    pub fn attach(&self, path: &Path, cap: usize) -> Result<Vec<Record>> {
        self.entries.remove(path);
        let mut records = self.drain_new(path)?;
        if records.len() > cap {
            records.drain(..records.len() - cap);
        }
        Ok(records)
    }

    /// Forget all state for a log file
    pub fn detach(&self, path: &Path) {
        self.entries.remove(path);
    }

    /// Clear cached state and re-ingest from the beginning
    pub fn reload(&self, path: &Path, cap: usize) -> Result<Vec<Record>> {
        self.attach(path, cap)
    }

    /// Return records appended since the last call, deduplicated by uuid
    pub fn poll(&self, path: &Path) -> Result<Vec<Record>> {
        self.drain_new(path)
    }

    fn drain_new(&self, path: &Path) -> Result<Vec<Record>> {
        let mut entry = self.entries.entry(path.to_path_buf()).or_default();

        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context_path("open log", path),
        };

        let len = file.metadata()?.len();
        if len < entry.offset {
            // File was truncated or replaced; start over but keep the seen
            // set so replayed records stay deduplicated.
            tracing::debug!(path = %path.display(), "log file shrank, resetting offset");
            entry.offset = 0;
        }
        if len == entry.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(entry.offset))?;
        let mut buf = Vec::with_capacity((len - entry.offset) as usize);
        file.read_to_end(&mut buf)?;

        let mut records = Vec::new();
        let mut consumed = 0usize;
        let mut cursor = 0usize;

        while let Some(nl) = buf[cursor..].iter().position(|&b| b == b'\n') {
            let line_end = cursor + nl;
            let line = String::from_utf8_lossy(&buf[cursor..line_end]);

            match parse_line(&line) {
                Ok(Some(record)) => {
                    let key = record.dedup_key();
                    match key {
                        Some(uuid) if entry.seen.contains(&uuid) => {
                            // Duplicate uuid within the session: no-op
                        }
                        Some(uuid) => {
                            entry.seen.insert(uuid);
                            records.push(record);
                        }
                        None => records.push(record),
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping malformed line");
                }
            }

            cursor = line_end + 1;
            consumed = cursor;
        }

        // Anything after the last newline is a partial append; re-read later.
        entry.offset += consumed as u64;
        Ok(records)
    }

    /// Whether a uuid has been observed on this log file
    pub fn has_seen(&self, path: &Path, uuid: &str) -> bool {
        self.entries
            .get(path)
            .map(|e| e.seen.contains(uuid))
            .unwrap_or(false)
    }
}

/// Filter applied to records arriving after a resumed child restarts.
///
/// A child invoked with the resume flag re-emits historical context with old
/// timestamps. A record is elided when its timestamp predates
/// `last_send_time - 5s` AND its uuid is already known to the session view.
pub fn gate_resumed(
    records: Vec<Record>,
    last_send_time: Option<DateTime<Utc>>,
    known_uuids: &HashSet<String>,
) -> Vec<Record> {
    let Some(sent_at) = last_send_time else {
        return records;
    };
    let cutoff = sent_at - Duration::seconds(GATE_SLACK_SECS);

    records
        .into_iter()
        .filter(|record| {
            let old = record.timestamp().map(|ts| ts < cutoff).unwrap_or(false);
            let known = record
                .uuid()
                .map(|u| known_uuids.contains(u))
                .unwrap_or(false);
            let elide = old && known;
            if elide {
                tracing::trace!(uuid = ?record.uuid(), "eliding re-emitted historical record");
            }
            !elide
        })
        .collect()
}

/// Discard summary records that back-reference a different session
pub fn drop_foreign_summaries(records: Vec<Record>, session_uuids: &HashSet<String>) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| match record {
            Record::Summary(s) => match &s.leaf_uuid {
                Some(leaf) => session_uuids.contains(leaf),
                None => true,
            },
            _ => true,
        })
        .collect()
}
