//! Per-agent permission tiers, tool settings, and instruction templates
//!
//! Permissions are stored as three explicit tool arrays (`common`,
//! `permissive`, `yolo`) plus an `additional_directories` array. Tiers are
//! arrays rather than a level enum so partially enabling a tier is
//! first-class.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::utils::fs::write_atomic;

/// Tools the child is never allowed to call through the core
pub const DEFAULT_DISALLOWED_TOOLS: &[&str] = &["Task"];

/// Tools that are structurally required and cannot be disabled
pub const REQUIRED_TOOLS: &[&str] = &["AskUserQuestion", "ExitPlanMode"];

/// The three permission tiers plus extra directories for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPermissions {
    #[serde(default)]
    pub common: Vec<String>,
    #[serde(default)]
    pub permissive: Vec<String>,
    #[serde(default)]
    pub yolo: Vec<String>,
    #[serde(default)]
    pub additional_directories: Vec<PathBuf>,
}

impl AgentPermissions {
    /// Baseline tier contents seeded into new agents
    pub fn template() -> Self {
        Self {
            common: vec![
                "Read".to_string(),
                "Glob".to_string(),
                "Grep".to_string(),
                "WebFetch".to_string(),
            ],
            permissive: vec!["Edit".to_string(), "Write".to_string(), "Bash".to_string()],
            yolo: Vec::new(),
            additional_directories: Vec::new(),
        }
    }

    /// All enabled tools as one list, tier order preserved, de-duplicated.
    /// Emitted as a single concatenated argument: passing two allow-lists
    /// under different spellings makes the child keep only one of them.
    pub fn allowed_tools(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.common
            .iter()
            .chain(self.permissive.iter())
            .chain(self.yolo.iter())
            .filter(|tool| seen.insert(tool.as_str().to_string()))
            .cloned()
            .collect()
    }

    /// Durably allow a tool (permanent permission grants land here)
    pub fn grant(&mut self, tool: &str) -> bool {
        if self.allowed_tools().iter().any(|t| t.as_str() == tool) {
            return false;
        }
        self.common.push(tool.to_string());
        true
    }
}

/// Permission file locations under the configuration root
#[derive(Debug, Clone)]
pub struct PermissionFiles {
    root: PathBuf,
}

impl PermissionFiles {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn agent_file(&self, agent_id: &str) -> PathBuf {
        self.root
            .join("permissions")
            .join(format!("{}.json", agent_id))
    }

    fn template_file(&self) -> PathBuf {
        self.root.join("permissions-template.json")
    }

    /// Load an agent's permissions, falling back to the global template and
    /// then to the built-in baseline
    pub async fn load(&self, agent_id: &str) -> Result<AgentPermissions> {
        for path in [self.agent_file(agent_id), self.template_file()] {
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => {
                    return serde_json::from_str(&contents)
                        .with_context(|| format!("Failed to parse '{}'", path.display()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to read '{}'", path.display()))
                }
            }
        }
        Ok(AgentPermissions::template())
    }

    pub async fn save(&self, agent_id: &str, permissions: &AgentPermissions) -> Result<()> {
        let contents = serde_json::to_string_pretty(permissions)?;
        write_atomic(&self.agent_file(agent_id), &contents).await
    }

    /// Grant a tool durably; the allow-list is persisted before returning
    pub async fn grant(&self, agent_id: &str, tool: &str) -> Result<AgentPermissions> {
        let mut permissions = self.load(agent_id).await?;
        if permissions.grant(tool) {
            self.save(agent_id, &permissions).await?;
            tracing::info!(agent = agent_id, tool, "permanently allowed tool");
        }
        Ok(permissions)
    }

    /// Add a directory to the agent's additional-directories array
    pub async fn add_directory(&self, agent_id: &str, dir: &Path) -> Result<AgentPermissions> {
        let mut permissions = self.load(agent_id).await?;
        if !permissions.additional_directories.iter().any(|d| d == dir) {
            permissions.additional_directories.push(dir.to_path_buf());
            self.save(agent_id, &permissions).await?;
        }
        Ok(permissions)
    }
}

/// User-editable tool instructions and availability
#[derive(Debug, Clone, Default)]
pub struct ToolSettings {
    /// Prefix prepended to every tool description
    pub instructions: String,
    /// Tool names disabled by the user; required tools are never honored here
    pub disabled: HashSet<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ToolAvailabilityFile {
    #[serde(default)]
    disabled: Vec<String>,
}

impl ToolSettings {
    /// Load from `tool-instructions.md` and `tool-availability.json` under
    /// the configuration root; both files are optional.
    pub async fn load(root: &Path) -> Result<Self> {
        let instructions =
            match tokio::fs::read_to_string(root.join("tool-instructions.md")).await {
                Ok(contents) => contents.trim().to_string(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e).context("Failed to read tool instructions"),
            };

        let disabled = match tokio::fs::read_to_string(root.join("tool-availability.json")).await {
            Ok(contents) => {
                let file: ToolAvailabilityFile =
                    serde_json::from_str(&contents).context("Failed to parse tool availability")?;
                file.disabled
                    .into_iter()
                    .filter(|tool| {
                        let required = REQUIRED_TOOLS.contains(&tool.as_str());
                        if required {
                            tracing::warn!(tool, "ignoring attempt to disable a required tool");
                        }
                        !required
                    })
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e).context("Failed to read tool availability"),
        };

        Ok(Self {
            instructions,
            disabled,
        })
    }

    pub fn is_enabled(&self, tool: &str) -> bool {
        !self.disabled.contains(tool)
    }
}

/// Copy the default CLAUDE.md template into `folder` when none exists
pub async fn ensure_claude_md(root: &Path, folder: &Path) -> Result<bool> {
    let target = folder.join("CLAUDE.md");
    if tokio::fs::try_exists(&target).await? {
        return Ok(false);
    }
    let template = root.join("templates").join("CLAUDE.default.md");
    let contents = match tokio::fs::read_to_string(&template).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).context("Failed to read CLAUDE.md template"),
    };
    tokio::fs::write(&target, contents).await?;
    tracing::info!(folder = %folder.display(), "seeded CLAUDE.md from template");
    Ok(true)
}
