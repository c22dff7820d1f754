//! Runtime state and the orchestrator
//!
//! One `Orchestrator` owns everything tied to the loaded workspace: the
//! watcher pool, the log cache, per-session view state, the child process
//! manager, the rendezvous managers, the stores, and the event bus. The
//! bound-method surface the view calls lives here. Structural changes
//! (workspace switch, agent add/remove) take the state write lock; per-
//! session reads go through the read lock.

pub mod session;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::bootstrap;
use crate::classify::Message;
use crate::config::permissions::{PermissionFiles, ToolSettings, DEFAULT_DISALLOWED_TOOLS};
use crate::config::{ensure_unique_slugs, AgentConfig, Workspace, WorkspaceStore};
use crate::events::{names, EventBus, EventEnvelope};
use crate::ingest::patch::apply_question_patch;
use crate::ingest::{LogLayout, SessionLogCache, FIFO_CAP};
use crate::process::{ChildProcessManager, SendInvocation, SendOutcome};
use crate::rendezvous::{PermissionReply, PlanReply, RendezvousSet};
use crate::server::handlers::AgentDirectory;
use crate::server::{self, tools, ToolContext, ToolServerHandle};
use crate::store::{BacklogStore, InboxStore};
use crate::utils::error::OrchestratorError;
use crate::utils::fs::{list_files, read_file_capped, FileContents};
use crate::watcher::{WatchSignal, WatcherPool};

use self::session::{QueuedMessage, SessionState};

/// Debounce window for `session:messages`
const MESSAGES_DEBOUNCE_MS: u64 = 50;

/// Directory names skipped by the file picker unless overridden
const DEFAULT_IGNORES: &[&str] = &[".git", "node_modules", "target", ".venv", "dist"];

/// Depth cap for the file picker walk
const DEFAULT_LIST_DEPTH: usize = 8;

struct WorkspaceState {
    workspace: Workspace,
    sessions: HashMap<String, SessionState>,
}

/// The core runtime object. One per process; lifecycle tied to the loaded
/// workspace, torn down and rebuilt on switch.
pub struct Orchestrator {
    registry: Arc<WorkspaceStore>,
    layout: LogLayout,
    bus: EventBus,
    rendezvous: Arc<RendezvousSet>,
    children: Arc<ChildProcessManager>,
    cache: Arc<SessionLogCache>,
    watcher: Arc<WatcherPool>,
    permissions: Arc<PermissionFiles>,
    inbox: Arc<RwLock<Option<Arc<InboxStore>>>>,
    backlogs: Arc<DashMap<String, Arc<BacklogStore>>>,
    directory: Arc<RwLock<AgentDirectory>>,
    settings: Arc<RwLock<ToolSettings>>,
    port: Arc<OnceLock<u16>>,
    state: Arc<RwLock<Option<WorkspaceState>>>,
    /// Sessions flagged for the next send's planning directive; auto-cleared
    planning: Mutex<HashSet<String>>,
    /// Sessions with a debounced messages event already scheduled
    emit_pending: Arc<Mutex<HashSet<String>>>,
    watch_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchSignal>>>,
    server: Mutex<Option<ToolServerHandle>>,
}

impl Orchestrator {
    pub fn new(registry: WorkspaceStore, layout: LogLayout, binary: &str) -> Arc<Self> {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(WatcherPool::new(layout.clone(), watch_tx));
        let permissions = Arc::new(PermissionFiles::new(registry.root().to_path_buf()));

        Arc::new(Self {
            registry: Arc::new(registry),
            layout,
            bus: EventBus::default(),
            rendezvous: Arc::new(RendezvousSet::new()),
            children: Arc::new(ChildProcessManager::new(binary)),
            cache: Arc::new(SessionLogCache::new()),
            watcher,
            permissions,
            inbox: Arc::new(RwLock::new(None)),
            backlogs: Arc::new(DashMap::new()),
            directory: Arc::new(RwLock::new(AgentDirectory::default())),
            settings: Arc::new(RwLock::new(ToolSettings::default())),
            port: Arc::new(OnceLock::new()),
            state: Arc::new(RwLock::new(None)),
            planning: Mutex::new(HashSet::new()),
            emit_pending: Arc::new(Mutex::new(HashSet::new())),
            watch_rx: Mutex::new(Some(watch_rx)),
            server: Mutex::new(None),
        })
    }

    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }

    /// Stop the tool server and abandon outstanding rendezvous requests
    pub fn shutdown(&self) {
        self.rendezvous.cancel_all();
        if let Some(handle) = self.server.lock().expect("server slot poisoned").take() {
            handle.stop();
        }
    }

    pub fn tool_server_port(&self) -> Option<u16> {
        self.port.get().copied()
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            bus: self.bus.clone(),
            rendezvous: Arc::clone(&self.rendezvous),
            inbox: Arc::clone(&self.inbox),
            backlogs: Arc::clone(&self.backlogs),
            children: Arc::clone(&self.children),
            permissions: Arc::clone(&self.permissions),
            directory: Arc::clone(&self.directory),
            settings: Arc::clone(&self.settings),
            registry: Arc::clone(&self.registry),
            port: Arc::clone(&self.port),
        }
    }

    /// Start the tool server and the ingest loop, then load the persisted
    /// current workspace (creating a default one on first run). Returns the
    /// tool server port.
    pub async fn start(self: &Arc<Self>) -> Result<u16> {
        *self.settings.write().await = ToolSettings::load(self.registry.root()).await?;

        let handle = server::start(self.tool_context()).await?;
        let port = handle.port;
        *self.server.lock().expect("server slot poisoned") = Some(handle);

        let rx = self
            .watch_rx
            .lock()
            .expect("watch receiver poisoned")
            .take()
            .context("Orchestrator already started")?;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.ingest_loop(rx).await });

        let current = match self.registry.current_workspace().await? {
            Some(id) => id,
            None => {
                let ids = self.registry.list_ids().await?;
                match ids.into_iter().next() {
                    Some(id) => id,
                    None => self.registry.create("Default").await?.id,
                }
            }
        };
        self.load_workspace(&current).await?;
        Ok(port)
    }

    // ------------------------------------------------------------------
    // Workspace lifecycle
    // ------------------------------------------------------------------

    /// Tear down the previous workspace's runtime and load another
    pub async fn load_workspace(&self, id: &str) -> Result<()> {
        self.bus.publish(EventEnvelope::new(
            names::LOADING_STATUS,
            json!({"phase": "loading-workspace", "workspaceId": id}),
        ));

        // Teardown order: outstanding rendezvous first so no tool handler
        // resolves against a dead workspace, then watches, then state.
        self.rendezvous.cancel_all();
        self.watcher.teardown();
        self.backlogs.clear();
        *self.state.write().await = None;

        let mut workspace = self.registry.load(id).await?;
        let remap = self.registry.reconcile_agent_ids(&mut workspace).await?;

        // Follow id remaps in the durable stores before anything reads them
        let inbox = Arc::new(InboxStore::open(&self.registry.inbox_db(id))?);
        if !remap.is_empty() {
            inbox.apply_agent_remap(&remap)?;
            for (old, new) in &remap {
                let old_db = self.registry.backlog_db(old);
                if old_db.exists() {
                    let new_db = self.registry.backlog_db(new);
                    if let Err(e) = std::fs::rename(&old_db, &new_db) {
                        tracing::error!(error = %e, "failed to move backlog db after remap");
                    }
                }
            }
        }
        *self.inbox.write().await = Some(inbox);

        {
            let mut directory = self.directory.write().await;
            directory.workspace_id = Some(workspace.id.clone());
            directory.agents = workspace.agents.clone();
            directory.env = workspace.env.clone();
            directory.additional_directories = workspace.additional_directories.clone();
        }

        // Build session state synchronously so the loaded event is complete;
        // the rescan also primes the watcher's announced set.
        let mut sessions = HashMap::new();
        for agent in &workspace.agents {
            if let Err(e) = self
                .watcher
                .start_agent(&agent.id, &agent.name, &agent.folder)
            {
                tracing::error!(agent = %agent.id, error = %e, "could not watch agent folder");
            }
            for session_id in self.layout.scan_sessions(&agent.folder) {
                let log_path = self.layout.session_log(&agent.folder, &session_id);
                let mut state = SessionState::new(&session_id, &agent.id, log_path.clone());
                match self.cache.attach(&log_path, FIFO_CAP) {
                    Ok(records) => state.rebuild(records),
                    Err(e) => {
                        tracing::warn!(session = %session_id, error = %e, "failed to attach session log")
                    }
                }
                sessions.insert(session_id, state);
            }
            self.watcher.rescan_sessions(&agent.id, &agent.folder);
        }

        let selection = workspace.selection.clone();
        let loaded_payload = json!({
            "workspace": {
                "id": workspace.id,
                "name": workspace.name,
                "agents": workspace.agents,
                "selection": workspace.selection,
            },
            "sessions": sessions
                .values()
                .map(|s| s.summary_payload())
                .collect::<Vec<_>>(),
        });

        *self.state.write().await = Some(WorkspaceState {
            workspace,
            sessions,
        });

        if let Some((agent_id, session_id)) = selection {
            if let Err(e) = self.set_active_session(&agent_id, &session_id).await {
                tracing::warn!(error = %e, "could not restore persisted selection");
            }
        }

        self.registry.set_current(id).await?;
        self.bus
            .publish(EventEnvelope::new(names::WORKSPACE_LOADED, loaded_payload));
        tracing::info!(workspace = id, "workspace loaded");
        Ok(())
    }

    pub async fn switch_workspace(&self, id: &str) -> Result<()> {
        self.bus.publish(EventEnvelope::new(
            names::WORKSPACE_CHANGED,
            json!({"workspaceId": id}),
        ));
        self.load_workspace(id).await
    }

    pub async fn create_workspace(&self, name: &str) -> Result<Workspace> {
        self.registry.create(name).await
    }

    pub async fn rename_workspace(&self, id: &str, name: &str) -> Result<Workspace> {
        let workspace = self.registry.rename(id, name).await?;
        self.bus.publish(EventEnvelope::new(
            names::WORKSPACE_CHANGED,
            json!({"workspaceId": id, "name": name}),
        ));
        Ok(workspace)
    }

    pub async fn delete_workspace(&self, id: &str) -> Result<()> {
        let was_current = {
            let state = self.state.read().await;
            state
                .as_ref()
                .map(|s| s.workspace.id == id)
                .unwrap_or(false)
        };
        self.registry.delete(id).await?;
        if was_current {
            if let Some(next) = self.registry.current_workspace().await? {
                self.load_workspace(&next).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agent CRUD
    // ------------------------------------------------------------------

    pub async fn add_agent(
        &self,
        name: &str,
        folder: PathBuf,
        description: Option<String>,
    ) -> Result<AgentConfig> {
        let mut agent = AgentConfig::new(name, folder.clone());
        agent.description = description;

        let workspace = {
            let mut state = self.state.write().await;
            let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            ws.workspace.agents.push(agent.clone());
            ensure_unique_slugs(&mut ws.workspace.agents);
            agent = ws
                .workspace
                .agents
                .last()
                .cloned()
                .expect("agent just pushed");
            ws.workspace.clone()
        };
        self.registry.save(&workspace).await?;

        // Seed supporting files and start watching
        let permissions = self.permissions.load(&agent.id).await?;
        self.permissions.save(&agent.id, &permissions).await?;
        crate::config::permissions::ensure_claude_md(self.registry.root(), &agent.folder).await?;
        self.watcher
            .start_agent(&agent.id, &agent.name, &agent.folder)?;
        self.watcher.rescan_sessions(&agent.id, &agent.folder);
        self.refresh_directory().await;

        self.bus.publish(EventEnvelope::for_agent(
            names::AGENT_ADDED,
            &agent.id,
            json!({"agent": agent}),
        ));
        Ok(agent)
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        let (folder, workspace) = {
            let mut state = self.state.write().await;
            let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            let agent = ws
                .workspace
                .agent(agent_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
            ws.workspace.agents.retain(|a| a.id != agent_id);
            ws.sessions.retain(|_, s| s.agent_id != agent_id);
            if ws
                .workspace
                .selection
                .as_ref()
                .map(|(a, _)| a == agent_id)
                .unwrap_or(false)
            {
                ws.workspace.selection = None;
                self.watcher.clear_active_session();
            }
            (agent.folder, ws.workspace.clone())
        };
        self.registry.save(&workspace).await?;
        self.watcher.stop_agent(agent_id, &folder);
        self.refresh_directory().await;

        self.bus.publish(EventEnvelope::for_agent(
            names::AGENT_REMOVED,
            agent_id,
            json!({}),
        ));
        Ok(())
    }

    async fn refresh_directory(&self) {
        let state = self.state.read().await;
        let Some(ws) = state.as_ref() else { return };
        let mut directory = self.directory.write().await;
        directory.workspace_id = Some(ws.workspace.id.clone());
        directory.agents = ws.workspace.agents.clone();
        directory.env = ws.workspace.env.clone();
        directory.additional_directories = ws.workspace.additional_directories.clone();
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Instant session creation: write the log prefix, no child involved
    pub async fn create_session(&self, agent_id: &str) -> Result<String> {
        let folder = self.agent_folder(agent_id).await?;
        let bootstrapped = bootstrap::create_session(&self.layout, &folder).await?;

        let mut state = SessionState::new(
            &bootstrapped.session_id,
            agent_id,
            bootstrapped.log_path.clone(),
        );
        let records = self.cache.attach(&bootstrapped.log_path, FIFO_CAP)?;
        state.rebuild(records);

        {
            let mut guard = self.state.write().await;
            let ws = guard.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            ws.sessions.insert(bootstrapped.session_id.clone(), state);
        }
        self.watcher.rescan_sessions(agent_id, &folder);
        self.emit_session_messages(agent_id, &bootstrapped.session_id).await;
        Ok(bootstrapped.session_id)
    }

    pub async fn rescan_sessions(&self, agent_id: &str) -> Result<usize> {
        let folder = self.agent_folder(agent_id).await?;
        Ok(self.watcher.rescan_sessions(agent_id, &folder))
    }

    /// Point the fine watch (and the persisted selection) at a session
    pub async fn set_active_session(&self, agent_id: &str, session_id: &str) -> Result<()> {
        self.watcher.set_active_session(agent_id, session_id)?;

        let workspace = {
            let mut state = self.state.write().await;
            let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            ws.workspace.selection = Some((agent_id.to_string(), session_id.to_string()));
            self.ensure_session_entry(ws, agent_id, session_id);
            ws.workspace.clone()
        };
        self.registry.save(&workspace).await?;
        Ok(())
    }

    pub async fn clear_active_session(&self) -> Result<()> {
        self.watcher.clear_active_session();
        let workspace = {
            let mut state = self.state.write().await;
            let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            ws.workspace.selection = None;
            ws.workspace.clone()
        };
        self.registry.save(&workspace).await?;
        Ok(())
    }

    fn ensure_session_entry(&self, ws: &mut WorkspaceState, agent_id: &str, session_id: &str) {
        if ws.sessions.contains_key(session_id) {
            return;
        }
        let Some(agent) = ws.workspace.agent(agent_id) else {
            return;
        };
        let log_path = self.layout.session_log(&agent.folder, session_id);
        let mut state = SessionState::new(session_id, agent_id, log_path.clone());
        if let Ok(records) = self.cache.attach(&log_path, FIFO_CAP) {
            state.rebuild(records);
        }
        ws.sessions.insert(session_id.to_string(), state);
    }

    /// Paged read from the session tail
    pub async fn get_session(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let ws = state.as_ref().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
        let session = ws
            .sessions
            .get(session_id)
            .with_context(|| format!("Unknown session: {}", session_id))?;
        Ok(session.page(limit, offset))
    }

    /// Cache the plan file the view associates with this session
    pub async fn set_plan_file_path(&self, session_id: &str, path: Option<PathBuf>) -> Result<()> {
        let mut state = self.state.write().await;
        let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
        let session = ws
            .sessions
            .get_mut(session_id)
            .with_context(|| format!("Unknown session: {}", session_id))?;
        session.plan_file_path = path;
        Ok(())
    }

    /// The view has rendered this session; unread resets from here
    pub async fn mark_session_viewed(&self, session_id: &str) -> Result<()> {
        let (agent_id, unread) = {
            let mut state = self.state.write().await;
            let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            let session = ws
                .sessions
                .get_mut(session_id)
                .with_context(|| format!("Unknown session: {}", session_id))?;
            session.last_viewed = Some(Utc::now());
            (session.agent_id.clone(), session.unread_count())
        };
        self.bus.publish(EventEnvelope::for_session(
            names::UNREAD_CHANGED,
            &agent_id,
            session_id,
            json!({"unread": unread}),
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Flag the next send on this session to run in planning mode
    pub fn set_planning_mode(&self, session_id: &str, enabled: bool) {
        let mut planning = self.planning.lock().expect("planning set poisoned");
        if enabled {
            planning.insert(session_id.to_string());
        } else {
            planning.remove(session_id);
        }
    }

    /// Dispatch a user message. If a child is already running for the
    /// session the message is queued and dispatched on completion.
    pub async fn send_message(
        self: &Arc<Self>,
        agent_id: &str,
        session_id: &str,
        text: &str,
        attachments: Vec<PathBuf>,
    ) -> Result<String> {
        if self.children.is_running(session_id) {
            return self.enqueue_message(session_id, text).await;
        }

        let pending_uuid = {
            let mut state = self.state.write().await;
            let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            self.ensure_session_entry(ws, agent_id, session_id);
            let session = ws
                .sessions
                .get_mut(session_id)
                .with_context(|| format!("Unknown session: {}", session_id))?;
            session.last_send_time = Some(Utc::now());
            session.push_pending(text)
        };
        self.emit_session_messages(agent_id, session_id).await;

        let invocation = self
            .build_invocation(agent_id, session_id, text, attachments)
            .await?;
        self.spawn_send(agent_id, session_id, invocation, Some(pending_uuid));
        Ok(session_id.to_string())
    }

    async fn build_invocation(
        &self,
        agent_id: &str,
        session_id: &str,
        text: &str,
        attachments: Vec<PathBuf>,
    ) -> Result<SendInvocation> {
        let (agent, env, mut dirs) = {
            let state = self.state.read().await;
            let ws = state.as_ref().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            let agent = ws
                .workspace
                .agent(agent_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
            (
                agent,
                ws.workspace.env.clone(),
                ws.workspace.additional_directories.clone(),
            )
        };

        let permissions = self.permissions.load(agent_id).await?;
        dirs.extend(permissions.additional_directories.clone());

        let mut allowed = permissions.allowed_tools();
        if agent.mcp_enabled {
            // The inter-agent tools ride the same single allow-list
            for tool in tools_catalog_names() {
                allowed.push(format!("mcp__claudefu__{}", tool));
            }
        }

        let planning = {
            let mut planning = self.planning.lock().expect("planning set poisoned");
            planning.remove(session_id)
        };

        Ok(SendInvocation {
            session_id: session_id.to_string(),
            folder: agent.folder.clone(),
            prompt: text.to_string(),
            attachments,
            resume: true,
            planning,
            allowed_tools: allowed,
            disallowed_tools: DEFAULT_DISALLOWED_TOOLS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            additional_directories: dirs,
            env,
            mcp_port: if agent.mcp_enabled {
                self.port.get().copied()
            } else {
                None
            },
        })
    }

    fn spawn_send(
        self: &Arc<Self>,
        agent_id: &str,
        session_id: &str,
        invocation: SendInvocation,
        pending_uuid: Option<String>,
    ) {
        let this = Arc::clone(self);
        let agent_id = agent_id.to_string();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let outcome = match this.children.run_send(&invocation).await {
                Ok(outcome) => outcome,
                Err(e) => SendOutcome {
                    success: false,
                    cancelled: false,
                    error: Some(format!("{:#}", e)),
                },
            };
            this.finish_send(&agent_id, &session_id, outcome, pending_uuid)
                .await;
        });
    }

    /// Completion of one send: settle the optimistic message, emit the
    /// authoritative `response_complete`, then dispatch the next queued send.
    async fn finish_send(
        self: &Arc<Self>,
        agent_id: &str,
        session_id: &str,
        outcome: SendOutcome,
        pending_uuid: Option<String>,
    ) {
        let next_queued = {
            let mut state = self.state.write().await;
            let session = state
                .as_mut()
                .and_then(|ws| ws.sessions.get_mut(session_id));
            match session {
                Some(session) => {
                    match (&pending_uuid, outcome.success, outcome.cancelled) {
                        (Some(uuid), false, false) => session.mark_failed(uuid),
                        (Some(uuid), _, _) => {
                            // The log now carries the message (or the send was
                            // cancelled); the optimistic copy has served its
                            // purpose either way.
                            session.pending.retain(|m| &m.uuid != uuid || m.is_failed)
                        }
                        (None, _, _) => {}
                    }
                    if outcome.success && !session.queue.is_empty() {
                        Some(session.queue.remove(0))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        // Authoritative completion signal, strictly after wait() returned
        self.bus.publish(EventEnvelope::for_session(
            names::RESPONSE_COMPLETE,
            agent_id,
            session_id,
            json!({
                "success": outcome.success,
                "cancelled": outcome.cancelled,
                "error": outcome.error,
            }),
        ));
        self.emit_session_messages(agent_id, session_id).await;

        if let Some(queued) = next_queued {
            tracing::info!(session = session_id, "dispatching queued message");
            if let Err(e) = self
                .send_message(agent_id, session_id, &queued.text, Vec::new())
                .await
            {
                tracing::error!(error = %e, "queued send failed to dispatch");
            }
        }
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    pub async fn enqueue_message(&self, session_id: &str, text: &str) -> Result<String> {
        let mut state = self.state.write().await;
        let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
        let session = ws
            .sessions
            .get_mut(session_id)
            .with_context(|| format!("Unknown session: {}", session_id))?;
        let queued = QueuedMessage::new(text);
        let id = queued.id.clone();
        session.queue.push(queued);
        tracing::debug!(session = session_id, "message queued");
        Ok(id)
    }

    pub async fn remove_queued(&self, session_id: &str, queued_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
        let session = ws
            .sessions
            .get_mut(session_id)
            .with_context(|| format!("Unknown session: {}", session_id))?;
        let before = session.queue.len();
        session.queue.retain(|q| q.id != queued_id);
        Ok(session.queue.len() != before)
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Interrupt the session's running child. `response_complete` follows
    /// from the send task once `wait` returns; the log is left untouched.
    pub fn cancel_session(&self, session_id: &str) -> bool {
        self.children.cancel(session_id)
    }

    /// Explicitly append the central "response interrupted" marker record.
    /// This is the caller's choice, never an automatic side effect, so the
    /// parent-uuid chain is only ever broken on request.
    pub async fn append_cancellation_marker(&self, session_id: &str) -> Result<()> {
        let log_path = {
            let state = self.state.read().await;
            let ws = state.as_ref().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            ws.sessions
                .get(session_id)
                .map(|s| s.log_path.clone())
                .with_context(|| format!("Unknown session: {}", session_id))?
        };

        let record = json!({
            "type": "user",
            "uuid": Uuid::new_v4().to_string(),
            "parentUuid": null,
            "sessionId": session_id,
            "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "message": {"role": "user", "content": crate::classify::INTERRUPT_MARKER.to_string() + "]"},
        });

        let mut line = record.to_string();
        line.push('\n');
        let mut contents = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&line);
        tokio::fs::write(&log_path, contents).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rendezvous bound methods
    // ------------------------------------------------------------------

    pub fn respond_question(&self, id: &str, answers: serde_json::Value) -> Result<()> {
        self.rendezvous.questions.respond(id, answers)?;
        Ok(())
    }

    pub fn skip_question(&self, id: &str) -> Result<()> {
        self.rendezvous.questions.skip(id)?;
        Ok(())
    }

    pub fn respond_permission(&self, id: &str, reply: PermissionReply) -> Result<()> {
        self.rendezvous.permissions.respond(id, reply)?;
        Ok(())
    }

    pub fn respond_plan(&self, id: &str, reply: PlanReply) -> Result<()> {
        self.rendezvous.plans.respond(id, reply)?;
        Ok(())
    }

    /// Answer a question whose built-in rendering failed inside the child:
    /// patch the log line, reload the session, then dispatch a zero-content
    /// resume so the child picks up from the answered question. The order
    /// (pause, patch, cache clear, resume) is load-bearing; do not reorder.
    pub async fn answer_question(
        self: &Arc<Self>,
        agent_id: &str,
        session_id: &str,
        tool_use_id: &str,
        answers: serde_json::Value,
    ) -> Result<bool> {
        let log_path = {
            let state = self.state.read().await;
            let ws = state.as_ref().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            ws.sessions
                .get(session_id)
                .map(|s| s.log_path.clone())
                .with_context(|| format!("Unknown session: {}", session_id))?
        };

        self.watcher.pause_active();
        let patched = apply_question_patch(&log_path, tool_use_id, &answers);
        let reload = self.cache.reload(&log_path, FIFO_CAP);
        self.watcher.resume_active();
        let patched = patched?;

        {
            let mut state = self.state.write().await;
            let ws = state.as_mut().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
            if let Some(session) = ws.sessions.get_mut(session_id) {
                session.rebuild(reload?);
                session.last_send_time = Some(Utc::now());
            }
        }
        self.emit_session_messages(agent_id, session_id).await;

        if patched {
            let invocation = self
                .build_invocation(agent_id, session_id, "question answered", Vec::new())
                .await?;
            self.spawn_send(agent_id, session_id, invocation, None);
        }
        Ok(patched)
    }

    // ------------------------------------------------------------------
    // Files (for the @-mention picker)
    // ------------------------------------------------------------------

    pub async fn list_agent_files(
        &self,
        agent_id: &str,
        ignore: Option<Vec<String>>,
        max_depth: Option<usize>,
    ) -> Result<Vec<PathBuf>> {
        let folder = self.agent_folder(agent_id).await?;
        let ignore = ignore.unwrap_or_else(|| {
            DEFAULT_IGNORES.iter().map(|s| s.to_string()).collect()
        });
        let depth = max_depth.unwrap_or(DEFAULT_LIST_DEPTH);
        Ok(list_files(&folder, &ignore, depth))
    }

    pub async fn read_file_content(&self, path: &Path) -> Result<FileContents> {
        read_file_capped(path).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn agent_folder(&self, agent_id: &str) -> Result<PathBuf> {
        let state = self.state.read().await;
        let ws = state.as_ref().ok_or(OrchestratorError::WorkspaceNotLoaded)?;
        ws.workspace
            .agent(agent_id)
            .map(|a| a.folder.clone())
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()).into())
    }

    async fn emit_session_messages(&self, agent_id: &str, session_id: &str) {
        let payload = {
            let state = self.state.read().await;
            let Some(ws) = state.as_ref() else { return };
            let Some(session) = ws.sessions.get(session_id) else {
                return;
            };
            json!({
                "messages": session.visible_messages(),
                "preview": session.preview(),
                "unreadCount": session.unread_count(),
            })
        };
        self.bus.publish(EventEnvelope::for_session(
            names::SESSION_MESSAGES,
            agent_id,
            session_id,
            payload,
        ));
    }

    /// Consume watcher signals: discover, poll, reload. Message events are
    /// debounced per session.
    async fn ingest_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<WatchSignal>) {
        while let Some(signal) = rx.recv().await {
            match signal {
                WatchSignal::SessionDiscovered {
                    agent_id,
                    session_id,
                    ..
                } => {
                    let created = {
                        let mut state = self.state.write().await;
                        match state.as_mut() {
                            Some(ws) if !ws.sessions.contains_key(&session_id) => {
                                self.ensure_session_entry(ws, &agent_id, &session_id);
                                ws.sessions.contains_key(&session_id)
                            }
                            _ => false,
                        }
                    };
                    if created {
                        tracing::info!(agent = %agent_id, session = %session_id, "session discovered");
                        self.emit_session_messages(&agent_id, &session_id).await;
                    }
                }
                WatchSignal::SessionModified {
                    agent_id,
                    session_id,
                    path,
                } => {
                    let records = match self.cache.poll(&path) {
                        Ok(records) => records,
                        Err(e) => {
                            tracing::debug!(error = %e, "poll failed");
                            continue;
                        }
                    };
                    let changed = {
                        let mut state = self.state.write().await;
                        match state.as_mut().and_then(|ws| ws.sessions.get_mut(&session_id)) {
                            Some(session) => session.ingest(records),
                            None => false,
                        }
                    };
                    if changed {
                        self.schedule_messages_emit(&agent_id, &session_id);
                    }
                }
                WatchSignal::SessionReload {
                    agent_id,
                    session_id,
                    path,
                } => {
                    let records = match self.cache.reload(&path, FIFO_CAP) {
                        Ok(records) => records,
                        Err(e) => {
                            tracing::debug!(error = %e, "reload failed");
                            continue;
                        }
                    };
                    {
                        let mut state = self.state.write().await;
                        if let Some(session) =
                            state.as_mut().and_then(|ws| ws.sessions.get_mut(&session_id))
                        {
                            session.rebuild(records);
                        }
                    }
                    self.emit_session_messages(&agent_id, &session_id).await;
                }
            }
        }
    }

    /// Debounced `session:messages`: bursts of file notifications coalesce
    /// into one event per window
    fn schedule_messages_emit(self: &Arc<Self>, agent_id: &str, session_id: &str) {
        {
            let mut pending = self.emit_pending.lock().expect("emit set poisoned");
            if !pending.insert(session_id.to_string()) {
                return;
            }
        }
        let this = Arc::clone(self);
        let agent_id = agent_id.to_string();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(MESSAGES_DEBOUNCE_MS)).await;
            this.emit_pending
                .lock()
                .expect("emit set poisoned")
                .remove(&session_id);
            this.emit_session_messages(&agent_id, &session_id).await;

            let unread = {
                let state = this.state.read().await;
                state
                    .as_ref()
                    .and_then(|ws| ws.sessions.get(&session_id))
                    .map(|s| s.unread_count())
            };
            if let Some(unread) = unread {
                this.bus.publish(EventEnvelope::for_session(
                    names::UNREAD_CHANGED,
                    &agent_id,
                    &session_id,
                    json!({"unread": unread}),
                ));
            }
        });
    }
}

fn tools_catalog_names() -> &'static [&'static str] {
    &[
        tools::AGENT_QUERY,
        tools::SELF_QUERY,
        tools::AGENT_MESSAGE,
        tools::AGENT_BROADCAST,
        tools::NOTIFY_USER,
        tools::ASK_USER_QUESTION,
        tools::REQUEST_TOOL_PERMISSION,
        tools::EXIT_PLAN_MODE,
        tools::BACKLOG_ADD,
        tools::BACKLOG_UPDATE,
        tools::BACKLOG_LIST,
    ]
}
