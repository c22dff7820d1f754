//! Durable configuration: workspaces, agents, and the global agent registry
//!
//! Workspaces persist as individual JSON files under the configuration root;
//! a single `current_workspace` file records the active one. Agent ids must
//! be globally unique across workspaces, enforced through the registry file:
//! on load, an id claimed by a different workspace is re-minted and the remap
//! is handed back so dependent stores can follow.

pub mod permissions;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::utils::error::OrchestratorError;
use crate::utils::fs::write_atomic;

fn default_true() -> bool {
    true
}

/// A durable binding between a display name and a local folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub folder: PathBuf,
    /// Identifier other agents use to address this one
    #[serde(default)]
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub mcp_enabled: bool,
}

impl AgentConfig {
    pub fn new(name: &str, folder: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            folder,
            slug: normalize_slug(name),
            description: None,
            mcp_enabled: true,
        }
    }
}

/// One workspace: an ordered set of agents plus the persisted selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// `(agent_id, session_id)` the view last had open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<(String, String)>,
    /// User-configured environment passed to children; wins over the parent
    /// environment on conflict
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Directories every child may access in addition to its agent folder
    #[serde(default)]
    pub additional_directories: Vec<PathBuf>,
}

impl Workspace {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            agents: Vec::new(),
            selection: None,
            env: HashMap::new(),
            additional_directories: Vec::new(),
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    pub fn agent_by_slug(&self, slug: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.slug == slug)
    }
}

static SLUG_SQUASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("slug regex"));

/// Normalized form of an agent name used for addressing: lowercase
/// alphanumerics with single dashes
pub fn normalize_slug(name: &str) -> String {
    let lowered = name.to_lowercase();
    let dashed = SLUG_SQUASH.replace_all(&lowered, "-");
    dashed.trim_matches('-').to_string()
}

/// Ensure each agent's slug is set and unique within the workspace
pub fn ensure_unique_slugs(agents: &mut [AgentConfig]) {
    let mut taken: HashMap<String, usize> = HashMap::new();
    for agent in agents.iter_mut() {
        if agent.slug.is_empty() {
            agent.slug = normalize_slug(&agent.name);
        }
        let base = if agent.slug.is_empty() {
            "agent".to_string()
        } else {
            agent.slug.clone()
        };
        let count = taken.entry(base.clone()).or_insert(0);
        *count += 1;
        agent.slug = if *count == 1 {
            base
        } else {
            format!("{}-{}", base, count)
        };
    }
}

/// Registry of agent id -> owning workspace id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AgentRegistry {
    #[serde(default)]
    agents: HashMap<String, String>,
}

/// File layout and persistence for workspaces under a configuration root
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    /// Store under the user configuration directory
    pub fn default_root() -> Result<Self> {
        let base = dirs::config_dir().context("Could not determine config directory")?;
        Ok(Self {
            root: base.join("claudefu"),
        })
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workspace_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    fn workspace_file(&self, id: &str) -> PathBuf {
        self.workspace_dir().join(format!("{}.json", id))
    }

    fn current_file(&self) -> PathBuf {
        self.root.join("current_workspace")
    }

    fn registry_file(&self) -> PathBuf {
        self.root.join("agent-registry.json")
    }

    /// Per-workspace inbox database
    pub fn inbox_db(&self, workspace_id: &str) -> PathBuf {
        self.root.join("inbox").join(format!("{}.db", workspace_id))
    }

    /// Per-agent backlog database
    pub fn backlog_db(&self, agent_id: &str) -> PathBuf {
        self.root.join("backlog").join(format!("{}.db", agent_id))
    }

    /// Legacy per-workspace backlog database, migrated lazily
    pub fn legacy_backlog_db(&self, workspace_id: &str) -> PathBuf {
        self.root
            .join("backlog")
            .join(format!("workspace-{}.db", workspace_id))
    }

    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let dir = self.workspace_dir();
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e).context("Failed to list workspaces"),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn load(&self, id: &str) -> Result<Workspace> {
        let path = self.workspace_file(id);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| OrchestratorError::WorkspaceNotFound(id.to_string()))?;
        let workspace: Workspace = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse workspace '{}'", path.display()))?;
        Ok(workspace)
    }

    pub async fn save(&self, workspace: &Workspace) -> Result<()> {
        let contents = serde_json::to_string_pretty(workspace)?;
        write_atomic(&self.workspace_file(&workspace.id), &contents).await
    }

    pub async fn create(&self, name: &str) -> Result<Workspace> {
        let workspace = Workspace::new(name);
        self.save(&workspace).await?;
        tracing::info!(id = %workspace.id, name, "created workspace");
        Ok(workspace)
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<Workspace> {
        let mut workspace = self.load(id).await?;
        workspace.name = name.to_string();
        self.save(&workspace).await?;
        Ok(workspace)
    }

    /// Delete a workspace. The only remaining workspace cannot be deleted.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let ids = self.list_ids().await?;
        if !ids.iter().any(|i| i == id) {
            return Err(OrchestratorError::WorkspaceNotFound(id.to_string()).into());
        }
        if ids.len() <= 1 {
            return Err(OrchestratorError::LastWorkspace.into());
        }
        tokio::fs::remove_file(self.workspace_file(id)).await?;

        // Drop registry claims owned by the deleted workspace
        let mut registry = self.load_registry().await?;
        registry.agents.retain(|_, ws| ws != id);
        self.save_registry(&registry).await?;

        if self.current_workspace().await?.as_deref() == Some(id) {
            if let Some(next) = ids.iter().find(|i| i.as_str() != id) {
                self.set_current(next).await?;
            }
        }
        Ok(())
    }

    pub async fn current_workspace(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.current_file()).await {
            Ok(contents) => {
                let id = contents.trim().to_string();
                Ok(if id.is_empty() { None } else { Some(id) })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read current workspace"),
        }
    }

    pub async fn set_current(&self, id: &str) -> Result<()> {
        write_atomic(&self.current_file(), id).await
    }

    async fn load_registry(&self) -> Result<AgentRegistry> {
        match tokio::fs::read_to_string(self.registry_file()).await {
            Ok(contents) => {
                serde_json::from_str(&contents).context("Failed to parse agent registry")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AgentRegistry::default()),
            Err(e) => Err(e).context("Failed to read agent registry"),
        }
    }

    async fn save_registry(&self, registry: &AgentRegistry) -> Result<()> {
        let contents = serde_json::to_string_pretty(registry)?;
        write_atomic(&self.registry_file(), &contents).await
    }

    /// Claim this workspace's agent ids in the global registry. Ids already
    /// claimed by a *different* workspace are re-minted; the returned remap
    /// pairs `(old_id, new_id)` must be applied to dependent stores and the
    /// workspace is re-saved when any remap occurred.
    pub async fn reconcile_agent_ids(
        &self,
        workspace: &mut Workspace,
    ) -> Result<Vec<(String, String)>> {
        let mut registry = self.load_registry().await?;
        let mut remap = Vec::new();

        for agent in &mut workspace.agents {
            match registry.agents.get(&agent.id) {
                Some(owner) if owner != &workspace.id => {
                    let fresh = Uuid::new_v4().to_string();
                    tracing::warn!(
                        old = %agent.id,
                        new = %fresh,
                        other_workspace = %owner,
                        "agent id already claimed elsewhere, re-minting"
                    );
                    remap.push((agent.id.clone(), fresh.clone()));
                    agent.id = fresh;
                }
                _ => {}
            }
            registry
                .agents
                .insert(agent.id.clone(), workspace.id.clone());
        }

        ensure_unique_slugs(&mut workspace.agents);
        self.save_registry(&registry).await?;
        if !remap.is_empty() {
            self.save(workspace).await?;
        }
        Ok(remap)
    }
}
