//! Per-workspace inbox: durable inter-agent messages

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Message urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// One durable inbox message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub id: String,
    pub from_agent_id: String,
    pub from_agent_name: String,
    pub to_agent_id: String,
    pub body: String,
    pub priority: Priority,
    /// Unix seconds
    pub timestamp: i64,
    pub read: bool,
}

/// One inbox database per workspace
pub struct InboxStore {
    conn: Mutex<Connection>,
}

impl InboxStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open inbox db '{}'", db_path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("inbox lock poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_messages (
                id TEXT PRIMARY KEY,
                from_agent TEXT NOT NULL,
                from_agent_name TEXT NOT NULL,
                to_agent TEXT NOT NULL,
                body TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'normal',
                timestamp INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_inbox_to ON inbox_messages(to_agent);
            CREATE INDEX IF NOT EXISTS idx_inbox_to_read ON inbox_messages(to_agent, read);
            "#,
        )?;
        Ok(())
    }

    /// Enqueue a message; the id and timestamp are assigned here
    pub fn insert(
        &self,
        from_agent_id: &str,
        from_agent_name: &str,
        to_agent_id: &str,
        body: &str,
        priority: Priority,
    ) -> Result<InboxMessage> {
        let msg = InboxMessage {
            id: Uuid::new_v4().to_string(),
            from_agent_id: from_agent_id.to_string(),
            from_agent_name: from_agent_name.to_string(),
            to_agent_id: to_agent_id.to_string(),
            body: body.to_string(),
            priority,
            timestamp: Utc::now().timestamp(),
            read: false,
        };
        let conn = self.conn.lock().expect("inbox lock poisoned");
        conn.execute(
            "INSERT INTO inbox_messages (id, from_agent, from_agent_name, to_agent, body, priority, timestamp, read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                msg.id,
                msg.from_agent_id,
                msg.from_agent_name,
                msg.to_agent_id,
                msg.body,
                msg.priority.as_str(),
                msg.timestamp,
            ],
        )?;
        Ok(msg)
    }

    /// Messages for an agent, newest first
    pub fn list_for_agent(&self, agent_id: &str) -> Result<Vec<InboxMessage>> {
        let conn = self.conn.lock().expect("inbox lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, from_agent, from_agent_name, to_agent, body, priority, timestamp, read
             FROM inbox_messages WHERE to_agent = ?1 ORDER BY timestamp DESC, id",
        )?;
        let rows = stmt.query_map(params![agent_id], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mark one message read. Marking twice is a no-op.
    pub fn mark_read(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("inbox lock poisoned");
        conn.execute("UPDATE inbox_messages SET read = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn mark_all_read(&self, agent_id: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("inbox lock poisoned");
        let n = conn.execute(
            "UPDATE inbox_messages SET read = 1 WHERE to_agent = ?1 AND read = 0",
            params![agent_id],
        )?;
        Ok(n)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("inbox lock poisoned");
        conn.execute("DELETE FROM inbox_messages WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// `(total, unread)` counts for an agent
    pub fn counts(&self, agent_id: &str) -> Result<(usize, usize)> {
        let conn = self.conn.lock().expect("inbox lock poisoned");
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM inbox_messages WHERE to_agent = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        let unread: i64 = conn.query_row(
            "SELECT COUNT(*) FROM inbox_messages WHERE to_agent = ?1 AND read = 0",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok((total as usize, unread as usize))
    }

    /// Rewrite agent ids after a registry remap
    pub fn apply_agent_remap(&self, remap: &[(String, String)]) -> Result<()> {
        let conn = self.conn.lock().expect("inbox lock poisoned");
        for (old, new) in remap {
            conn.execute(
                "UPDATE inbox_messages SET to_agent = ?2 WHERE to_agent = ?1",
                params![old, new],
            )?;
            conn.execute(
                "UPDATE inbox_messages SET from_agent = ?2 WHERE from_agent = ?1",
                params![old, new],
            )?;
        }
        Ok(())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboxMessage> {
    let priority: String = row.get(5)?;
    let read: i64 = row.get(7)?;
    Ok(InboxMessage {
        id: row.get(0)?,
        from_agent_id: row.get(1)?,
        from_agent_name: row.get(2)?,
        to_agent_id: row.get(3)?,
        body: row.get(4)?,
        priority: Priority::parse(&priority),
        timestamp: row.get(6)?,
        read: read != 0,
    })
}
