//! Command-line surface
//!
//! The desktop shell embeds the orchestrator directly; this binary exists for
//! headless use and scripting. It parses, constructs the [`Orchestrator`],
//! and delegates.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::WorkspaceStore;
use crate::ingest::LogLayout;
use crate::runtime::Orchestrator;

#[derive(Parser)]
#[command(name = "claudefu", version, about = "Multi-agent orchestration core for Claude Code")]
pub struct Cli {
    /// Configuration root (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config_root: Option<PathBuf>,

    /// Session log root (defaults to the assistant's log directory)
    #[arg(long, global = true)]
    pub log_root: Option<PathBuf>,

    /// Assistant binary to spawn
    #[arg(long, global = true, default_value = "claude")]
    pub binary: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the orchestrator and tool server until interrupted
    Serve,
    /// Workspace management
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    /// Session management
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Subcommand)]
pub enum WorkspaceCommand {
    /// List workspaces, marking the current one
    List,
    /// Create a workspace
    Create { name: String },
}

#[derive(Subcommand)]
pub enum SessionCommand {
    /// Instantly create a session for an agent (by id)
    New { agent_id: String },
}

impl Cli {
    fn registry(&self) -> Result<WorkspaceStore> {
        match &self.config_root {
            Some(root) => Ok(WorkspaceStore::with_root(root.clone())),
            None => WorkspaceStore::default_root(),
        }
    }

    fn layout(&self) -> Result<LogLayout> {
        match &self.log_root {
            Some(root) => Ok(LogLayout::with_root(root.clone())),
            None => LogLayout::default_root(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let registry = self.registry()?;
        let layout = self.layout()?;

        match &self.command {
            Command::Serve => {
                let orchestrator = Orchestrator::new(registry, layout, &self.binary);
                let port = orchestrator.start().await?;
                println!("claudefu tool server on 127.0.0.1:{}", port);
                tokio::signal::ctrl_c().await?;
                tracing::info!("shutting down");
                orchestrator.shutdown();
                Ok(())
            }
            Command::Workspace { command } => match command {
                WorkspaceCommand::List => {
                    let current = registry.current_workspace().await?;
                    for id in registry.list_ids().await? {
                        let workspace = registry.load(&id).await?;
                        let marker = if current.as_deref() == Some(id.as_str()) {
                            "*"
                        } else {
                            " "
                        };
                        println!("{} {}  {}", marker, id, workspace.name);
                    }
                    Ok(())
                }
                WorkspaceCommand::Create { name } => {
                    let workspace = registry.create(name).await?;
                    println!("{}", workspace.id);
                    Ok(())
                }
            },
            Command::Session { command } => match command {
                SessionCommand::New { agent_id } => {
                    let orchestrator = Orchestrator::new(registry, layout, &self.binary);
                    orchestrator.start().await?;
                    let session_id = orchestrator.create_session(agent_id).await?;
                    println!("{}", session_id);
                    Ok(())
                }
            },
        }
    }
}
