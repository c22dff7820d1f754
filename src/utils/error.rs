//! Error handling utilities

use anyhow::{Context, Result};

/// Typed errors for conditions callers match on
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Session {session_id} is already active for agent '{agent_name}'")]
    SessionActiveElsewhere {
        session_id: String,
        agent_name: String,
    },

    #[error("No workspace is loaded")]
    WorkspaceNotLoaded,

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Cannot delete the only workspace")]
    LastWorkspace,

    #[error("Assistant binary '{0}' is not available on PATH")]
    ChildMissing(String),

    #[error("Request timed out waiting for a reply")]
    RendezvousTimeout,

    #[error("Request was cancelled before a reply arrived")]
    RendezvousClosed,

    #[error("Tool '{0}' is disabled")]
    ToolDisabled(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extension trait for Result types
pub trait ResultExt<T> {
    /// Add context with a standard "Failed to" prefix
    fn context_op(self, operation: &str) -> Result<T>;

    /// Add context with file path information
    fn context_path(self, operation: &str, path: &std::path::Path) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context_op(self, operation: &str) -> Result<T> {
        self.context(format!("Failed to {}", operation))
    }

    fn context_path(self, operation: &str, path: &std::path::Path) -> Result<T> {
        self.context(format!("Failed to {} at '{}'", operation, path.display()))
    }
}
