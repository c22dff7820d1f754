//! Per-agent backlog: a hierarchical, ordered work list
//!
//! Siblings are ordered by `sort_order` with 1000-step gaps. Moving an item
//! takes the midpoint between its new neighbors; when the gap collapses the
//! siblings are reindexed at 1000-step strides first. Deletion cascades to
//! descendants breadth-first inside one transaction.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Gap between freshly indexed siblings
const SORT_STRIDE: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogStatus {
    Idea,
    Planned,
    InProgress,
    Done,
    Parked,
}

impl BacklogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacklogStatus::Idea => "idea",
            BacklogStatus::Planned => "planned",
            BacklogStatus::InProgress => "in_progress",
            BacklogStatus::Done => "done",
            BacklogStatus::Parked => "parked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idea" => Some(BacklogStatus::Idea),
            "planned" => Some(BacklogStatus::Planned),
            "in_progress" => Some(BacklogStatus::InProgress),
            "done" => Some(BacklogStatus::Done),
            "parked" => Some(BacklogStatus::Parked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogType {
    BugFix,
    NewFeature,
    FeatureExpansion,
    Improvement,
    Refactor,
    Validation,
    TechDebt,
    Documentation,
}

impl BacklogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacklogType::BugFix => "bug_fix",
            BacklogType::NewFeature => "new_feature",
            BacklogType::FeatureExpansion => "feature_expansion",
            BacklogType::Improvement => "improvement",
            BacklogType::Refactor => "refactor",
            BacklogType::Validation => "validation",
            BacklogType::TechDebt => "tech_debt",
            BacklogType::Documentation => "documentation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bug_fix" => Some(BacklogType::BugFix),
            "new_feature" => Some(BacklogType::NewFeature),
            "feature_expansion" => Some(BacklogType::FeatureExpansion),
            "improvement" => Some(BacklogType::Improvement),
            "refactor" => Some(BacklogType::Refactor),
            "validation" => Some(BacklogType::Validation),
            "tech_debt" => Some(BacklogType::TechDebt),
            "documentation" => Some(BacklogType::Documentation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogItem {
    pub id: String,
    pub agent_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub context: String,
    pub status: BacklogStatus,
    pub item_type: BacklogType,
    /// Comma-separated tag string
    pub tags: String,
    pub sort_order: i64,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct BacklogUpdate {
    pub title: Option<String>,
    pub context: Option<String>,
    /// Append to the existing context instead of replacing it
    pub append_context: bool,
    pub status: Option<BacklogStatus>,
    pub item_type: Option<BacklogType>,
    pub tags: Option<String>,
}

/// One backlog database per agent
pub struct BacklogStore {
    conn: Mutex<Connection>,
    agent_id: String,
}

impl BacklogStore {
    pub fn open(db_path: &Path, agent_id: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open backlog db '{}'", db_path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
            agent_id: agent_id.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory(agent_id: &str) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            agent_id: agent_id.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("backlog lock poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS backlog_items (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                parent_id TEXT,
                title TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'idea',
                item_type TEXT NOT NULL DEFAULT 'improvement',
                tags TEXT NOT NULL DEFAULT '',
                sort_order INTEGER NOT NULL,
                created_by TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_backlog_agent_parent
                ON backlog_items(agent_id, parent_id);
            CREATE INDEX IF NOT EXISTS idx_backlog_agent_status
                ON backlog_items(agent_id, status);
            CREATE INDEX IF NOT EXISTS idx_backlog_agent_parent_order
                ON backlog_items(agent_id, parent_id, sort_order);
            "#,
        )?;
        Ok(())
    }

    /// Copy this agent's rows out of the legacy per-workspace database.
    /// Running it again is a no-op, so migration is a fixpoint.
    pub fn migrate_from_workspace_db(&self, legacy_path: &Path) -> Result<usize> {
        if !legacy_path.exists() {
            return Ok(0);
        }
        let legacy = Connection::open(legacy_path)
            .with_context(|| format!("Failed to open legacy db '{}'", legacy_path.display()))?;

        let mut stmt = legacy.prepare(
            "SELECT id, agent_id, parent_id, title, context, status, item_type, tags,
                    sort_order, created_by, created_at, updated_at
             FROM backlog_items WHERE agent_id = ?1",
        )?;
        let rows = stmt.query_map(params![self.agent_id], row_to_item)?;

        let conn = self.conn.lock().expect("backlog lock poisoned");
        let mut migrated = 0;
        for row in rows {
            let item = row?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO backlog_items
                 (id, agent_id, parent_id, title, context, status, item_type, tags,
                  sort_order, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    item.id,
                    item.agent_id,
                    item.parent_id,
                    item.title,
                    item.context,
                    item.status.as_str(),
                    item.item_type.as_str(),
                    item.tags,
                    item.sort_order,
                    item.created_by,
                    item.created_at,
                    item.updated_at,
                ],
            )?;
            migrated += inserted;
        }
        if migrated > 0 {
            tracing::info!(agent = %self.agent_id, migrated, "migrated backlog items from workspace db");
        }
        Ok(migrated)
    }

    /// Add an item at the end of its sibling group
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        parent_id: Option<&str>,
        title: &str,
        context: &str,
        status: BacklogStatus,
        item_type: BacklogType,
        tags: &str,
        created_by: &str,
    ) -> Result<BacklogItem> {
        let conn = self.conn.lock().expect("backlog lock poisoned");

        if let Some(parent) = parent_id {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM backlog_items WHERE id = ?1 AND agent_id = ?2",
                    params![parent, self.agent_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                bail!("Parent item '{}' not found for this agent", parent);
            }
        }

        let max_order: Option<i64> = conn.query_row(
            "SELECT MAX(sort_order) FROM backlog_items
             WHERE agent_id = ?1 AND parent_id IS ?2",
            params![self.agent_id, parent_id],
            |row| row.get(0),
        )?;

        let now = Utc::now().timestamp();
        let item = BacklogItem {
            id: Uuid::new_v4().to_string(),
            agent_id: self.agent_id.clone(),
            parent_id: parent_id.map(|s| s.to_string()),
            title: title.to_string(),
            context: context.to_string(),
            status,
            item_type,
            tags: tags.to_string(),
            sort_order: max_order.unwrap_or(0) + SORT_STRIDE,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };

        conn.execute(
            "INSERT INTO backlog_items
             (id, agent_id, parent_id, title, context, status, item_type, tags,
              sort_order, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                item.id,
                item.agent_id,
                item.parent_id,
                item.title,
                item.context,
                item.status.as_str(),
                item.item_type.as_str(),
                item.tags,
                item.sort_order,
                item.created_by,
                item.created_at,
                item.updated_at,
            ],
        )?;
        Ok(item)
    }

    pub fn get(&self, id: &str) -> Result<Option<BacklogItem>> {
        let conn = self.conn.lock().expect("backlog lock poisoned");
        let item = conn
            .query_row(
                "SELECT id, agent_id, parent_id, title, context, status, item_type, tags,
                        sort_order, created_by, created_at, updated_at
                 FROM backlog_items WHERE id = ?1 AND agent_id = ?2",
                params![id, self.agent_id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    pub fn update(&self, id: &str, update: BacklogUpdate) -> Result<BacklogItem> {
        let existing = self
            .get(id)?
            .with_context(|| format!("Backlog item '{}' not found", id))?;

        let context = match (&update.context, update.append_context) {
            (Some(addition), true) if !existing.context.is_empty() => {
                format!("{}\n{}", existing.context, addition)
            }
            (Some(replacement), _) => replacement.clone(),
            (None, _) => existing.context.clone(),
        };

        let conn = self.conn.lock().expect("backlog lock poisoned");
        conn.execute(
            "UPDATE backlog_items
             SET title = ?2, context = ?3, status = ?4, item_type = ?5, tags = ?6, updated_at = ?7
             WHERE id = ?1 AND agent_id = ?8",
            params![
                id,
                update.title.as_deref().unwrap_or(&existing.title),
                context,
                update.status.unwrap_or(existing.status).as_str(),
                update.item_type.unwrap_or(existing.item_type).as_str(),
                update.tags.as_deref().unwrap_or(&existing.tags),
                Utc::now().timestamp(),
                self.agent_id,
            ],
        )?;
        drop(conn);

        self.get(id)?
            .with_context(|| format!("Backlog item '{}' vanished during update", id))
    }

    /// Reposition an item under `new_parent`, directly after `after`
    /// (or first among its siblings when `after` is `None`).
    pub fn move_item(
        &self,
        id: &str,
        new_parent: Option<&str>,
        after: Option<&str>,
    ) -> Result<BacklogItem> {
        if new_parent == Some(id) {
            bail!("Cannot move an item under itself");
        }
        self.get(id)?
            .with_context(|| format!("Backlog item '{}' not found", id))?;

        if let Some(parent) = new_parent {
            if self.get(parent)?.is_none() {
                bail!("Parent item '{}' not found for this agent", parent);
            }
            if self.descendants(id)?.contains(&parent.to_string()) {
                bail!("Cannot move an item under its own descendant");
            }
        }

        let order = match self.place_between(id, new_parent, after)? {
            Some(order) => order,
            None => {
                // Gap collapsed: reindex the sibling group, then place again
                self.reindex_siblings(new_parent, id)?;
                self.place_between(id, new_parent, after)?
                    .context("Sort order still colliding after reindex")?
            }
        };

        let conn = self.conn.lock().expect("backlog lock poisoned");
        conn.execute(
            "UPDATE backlog_items SET parent_id = ?2, sort_order = ?3, updated_at = ?4
             WHERE id = ?1 AND agent_id = ?5",
            params![
                id,
                new_parent,
                order,
                Utc::now().timestamp(),
                self.agent_id
            ],
        )?;
        drop(conn);

        self.get(id)?
            .with_context(|| format!("Backlog item '{}' vanished during move", id))
    }

    /// Delete an item and all its descendants in one transaction
    pub fn delete(&self, id: &str) -> Result<usize> {
        let mut doomed = self.descendants(id)?;
        doomed.push(id.to_string());

        let mut conn = self.conn.lock().expect("backlog lock poisoned");
        let tx = conn.transaction()?;
        let mut removed = 0;
        for item_id in &doomed {
            removed += tx.execute(
                "DELETE FROM backlog_items WHERE id = ?1 AND agent_id = ?2",
                params![item_id, self.agent_id],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// All items for this agent, grouped by parent, siblings in sort order
    pub fn list(&self) -> Result<Vec<BacklogItem>> {
        let conn = self.conn.lock().expect("backlog lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, parent_id, title, context, status, item_type, tags,
                    sort_order, created_by, created_at, updated_at
             FROM backlog_items WHERE agent_id = ?1
             ORDER BY parent_id IS NOT NULL, parent_id, sort_order",
        )?;
        let rows = stmt.query_map(params![self.agent_id], row_to_item)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Ordered sibling ids under `parent`, excluding `skip`
    fn siblings(&self, parent: Option<&str>, skip: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().expect("backlog lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, sort_order FROM backlog_items
             WHERE agent_id = ?1 AND parent_id IS ?2 AND id != ?3
             ORDER BY sort_order",
        )?;
        let rows = stmt.query_map(params![self.agent_id, parent, skip], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Compute the sort order for placing `id` after `after` under `parent`.
    /// Returns `None` when the neighboring gap has collapsed.
    fn place_between(
        &self,
        id: &str,
        parent: Option<&str>,
        after: Option<&str>,
    ) -> Result<Option<i64>> {
        let siblings = self.siblings(parent, id)?;

        let (prev, next) = match after {
            None => (None, siblings.first().map(|(_, o)| *o)),
            Some(after_id) => {
                let pos = siblings
                    .iter()
                    .position(|(sid, _)| sid == after_id)
                    .with_context(|| format!("Anchor item '{}' is not a sibling", after_id))?;
                (
                    Some(siblings[pos].1),
                    siblings.get(pos + 1).map(|(_, o)| *o),
                )
            }
        };

        let order = match (prev, next) {
            (None, None) => SORT_STRIDE,
            (Some(p), None) => p + SORT_STRIDE,
            (None, Some(n)) => {
                if n <= 1 {
                    return Ok(None);
                }
                n / 2
            }
            (Some(p), Some(n)) => {
                if n - p <= 1 {
                    return Ok(None);
                }
                p + (n - p) / 2
            }
        };
        Ok(Some(order))
    }

    /// Reassign a sibling group to 1000-step strides
    fn reindex_siblings(&self, parent: Option<&str>, skip: &str) -> Result<()> {
        let siblings = self.siblings(parent, skip)?;
        let conn = self.conn.lock().expect("backlog lock poisoned");
        for (i, (sid, _)) in siblings.iter().enumerate() {
            conn.execute(
                "UPDATE backlog_items SET sort_order = ?2 WHERE id = ?1 AND agent_id = ?3",
                params![sid, (i as i64 + 1) * SORT_STRIDE, self.agent_id],
            )?;
        }
        tracing::debug!(parent = ?parent, count = siblings.len(), "reindexed backlog siblings");
        Ok(())
    }

    /// Ids of every descendant of `id`, breadth-first
    fn descendants(&self, id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("backlog lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id FROM backlog_items WHERE agent_id = ?1 AND parent_id = ?2",
        )?;

        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            let rows = stmt.query_map(params![self.agent_id, current], |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                let child = row?;
                queue.push_back(child.clone());
                out.push(child);
            }
        }
        Ok(out)
    }
}

/// Render items as the XML envelope returned by `BacklogList`. XML avoids
/// collisions with Markdown or structured content inside titles and contexts.
pub fn render_xml(items: &[BacklogItem]) -> String {
    let mut out = String::from("<backlog>\n");
    for item in items {
        out.push_str(&format!(
            "  <item id=\"{}\" status=\"{}\" type=\"{}\" tags=\"{}\"{}>\n",
            escape_xml(&item.id),
            item.status.as_str(),
            item.item_type.as_str(),
            escape_xml(&item.tags),
            match &item.parent_id {
                Some(parent) => format!(" parent=\"{}\"", escape_xml(parent)),
                None => String::new(),
            }
        ));
        out.push_str(&format!("    <title>{}</title>\n", escape_xml(&item.title)));
        out.push_str(&format!(
            "    <context>{}</context>\n",
            escape_xml(&item.context)
        ));
        out.push_str("  </item>\n");
    }
    out.push_str("</backlog>");
    out
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<BacklogItem> {
    let status: String = row.get(5)?;
    let item_type: String = row.get(6)?;
    Ok(BacklogItem {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        parent_id: row.get(2)?,
        title: row.get(3)?,
        context: row.get(4)?,
        status: BacklogStatus::parse(&status).unwrap_or(BacklogStatus::Idea),
        item_type: BacklogType::parse(&item_type).unwrap_or(BacklogType::Improvement),
        tags: row.get(7)?,
        sort_order: row.get(8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn add_simple(store: &BacklogStore, parent: Option<&str>, title: &str) -> BacklogItem {
        store
            .add(
                parent,
                title,
                "",
                BacklogStatus::Idea,
                BacklogType::Improvement,
                "",
                "user",
            )
            .unwrap()
    }

    #[test]
    fn add_assigns_thousand_step_orders() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let first = add_simple(&store, None, "one");
        let second = add_simple(&store, None, "two");
        assert_eq!(first.sort_order, 1000);
        assert_eq!(second.sort_order, 2000);
    }

    #[test]
    fn children_require_existing_parent() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let parent = add_simple(&store, None, "parent");
        let child = add_simple(&store, Some(&parent.id), "child");
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));

        assert!(store
            .add(
                Some("missing"),
                "orphan",
                "",
                BacklogStatus::Idea,
                BacklogType::Improvement,
                "",
                "user",
            )
            .is_err());
    }

    #[test]
    fn update_append_context() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let item = store
            .add(
                None,
                "item",
                "first line",
                BacklogStatus::Idea,
                BacklogType::Improvement,
                "",
                "user",
            )
            .unwrap();

        let updated = store
            .update(
                &item.id,
                BacklogUpdate {
                    context: Some("second line".to_string()),
                    append_context: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.context, "first line\nsecond line");

        let replaced = store
            .update(
                &item.id,
                BacklogUpdate {
                    context: Some("fresh".to_string()),
                    append_context: false,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(replaced.context, "fresh");
    }

    #[test]
    fn move_takes_midpoint() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let a = add_simple(&store, None, "a");
        let b = add_simple(&store, None, "b");
        let c = add_simple(&store, None, "c");

        let moved = store.move_item(&c.id, None, Some(&a.id)).unwrap();
        assert!(moved.sort_order > a.sort_order && moved.sort_order < b.sort_order);

        let order: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }

    #[test]
    fn collapsed_gap_triggers_reindex() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let a = add_simple(&store, None, "a");
        let b = add_simple(&store, None, "b");
        let c = add_simple(&store, None, "c");

        // Force adjacent sort orders so the midpoint has no room
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE backlog_items SET sort_order = 1000 WHERE id = ?1",
                params![a.id],
            )
            .unwrap();
            conn.execute(
                "UPDATE backlog_items SET sort_order = 1001 WHERE id = ?1",
                params![b.id],
            )
            .unwrap();
        }

        let moved = store.move_item(&c.id, None, Some(&a.id)).unwrap();

        let items = store.list().unwrap();
        let orders: Vec<(String, i64)> = items
            .iter()
            .map(|i| (i.title.clone(), i.sort_order))
            .collect();

        // Reindexed siblings sit on 1000-step strides; the moved item lands
        // strictly between its neighbors.
        let a_order = orders.iter().find(|(t, _)| t == "a").unwrap().1;
        let b_order = orders.iter().find(|(t, _)| t == "b").unwrap().1;
        assert_eq!(a_order, 1000);
        assert_eq!(b_order, 2000);
        assert!(moved.sort_order > a_order && moved.sort_order < b_order);
    }

    #[test]
    fn move_to_front_of_group() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let a = add_simple(&store, None, "a");
        let b = add_simple(&store, None, "b");

        let moved = store.move_item(&b.id, None, None).unwrap();
        assert!(moved.sort_order < a.sort_order);
    }

    #[test]
    fn move_roundtrip_restores_order() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let a = add_simple(&store, None, "a");
        let b = add_simple(&store, None, "b");
        let _c = add_simple(&store, None, "c");

        let titles = |store: &BacklogStore| -> Vec<String> {
            store.list().unwrap().into_iter().map(|i| i.title).collect()
        };
        let before = titles(&store);

        store.move_item(&b.id, None, None).unwrap();
        store.move_item(&b.id, None, Some(&a.id)).unwrap();
        assert_eq!(titles(&store), before);
    }

    #[test]
    fn delete_cascades_to_descendants() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let root = add_simple(&store, None, "root");
        let child = add_simple(&store, Some(&root.id), "child");
        let _grandchild = add_simple(&store, Some(&child.id), "grandchild");
        let bystander = add_simple(&store, None, "bystander");

        let removed = store.delete(&root.id).unwrap();
        assert_eq!(removed, 3);

        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, bystander.id);
    }

    #[test]
    fn siblings_strictly_increase() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        for i in 0..5 {
            add_simple(&store, None, &format!("item-{}", i));
        }
        let items = store.list().unwrap();
        for pair in items.windows(2) {
            assert!(pair[0].sort_order < pair[1].sort_order);
        }
    }

    #[test]
    fn migration_is_fixpointed() {
        let dir = tempfile::TempDir::new().unwrap();
        let legacy_path = dir.path().join("workspace-backlog.db");

        // Seed a legacy per-workspace database with two agents' rows
        {
            let legacy = BacklogStore::open(&legacy_path, "a-1").unwrap();
            add_simple(&legacy, None, "mine");
            let other = BacklogStore::open(&legacy_path, "a-2").unwrap();
            add_simple(&other, None, "theirs");
        }

        let store = BacklogStore::open_in_memory("a-1").unwrap();
        let first = store.migrate_from_workspace_db(&legacy_path).unwrap();
        assert_eq!(first, 1);
        let second = store.migrate_from_workspace_db(&legacy_path).unwrap();
        assert_eq!(second, 0);

        let items = store.list().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "mine");
    }

    #[test]
    fn xml_rendering_escapes_content() {
        let store = BacklogStore::open_in_memory("a-1").unwrap();
        store
            .add(
                None,
                "Fix <Panel> & friends",
                "Use `code` blocks\n- bullet",
                BacklogStatus::Planned,
                BacklogType::BugFix,
                "ui,markdown",
                "agent",
            )
            .unwrap();

        let xml = render_xml(&store.list().unwrap());
        assert!(xml.contains("<backlog>"));
        assert!(xml.contains("status=\"planned\""));
        assert!(xml.contains("type=\"bug_fix\""));
        assert!(xml.contains("Fix &lt;Panel&gt; &amp; friends"));
        assert!(!xml.contains("<Panel>"));
    }
}
