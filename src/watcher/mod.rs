//! Two-tier file watching over session logs
//!
//! Coarse tier: one directory watch per agent's log directory, discovering
//! new sessions from file creation. Fine tier: at most one watch on the
//! currently selected session's file, driving log ingest. Agents are
//! addressed by id throughout since several agents may share a folder.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::ingest::LogLayout;
use crate::utils::error::OrchestratorError;

/// Signals the ingest loop consumes
#[derive(Debug, Clone, PartialEq)]
pub enum WatchSignal {
    /// A session file appeared in an agent's log directory
    SessionDiscovered {
        agent_id: String,
        session_id: String,
        path: PathBuf,
    },
    /// The active session's file changed
    SessionModified {
        agent_id: String,
        session_id: String,
        path: PathBuf,
    },
    /// The session cache must be cleared and re-read
    SessionReload {
        agent_id: String,
        session_id: String,
        path: PathBuf,
    },
}

struct AgentWatch {
    folder: PathBuf,
    name: String,
    _watcher: RecommendedWatcher,
}

struct FineWatch {
    agent_id: String,
    session_id: String,
    paused: Arc<AtomicBool>,
    _watcher: RecommendedWatcher,
}

#[derive(Default)]
struct PoolState {
    agents: HashMap<String, AgentWatch>,
    folder_agents: HashMap<PathBuf, HashSet<String>>,
    /// Per-agent claim on its open session; a claim persists until the agent
    /// clears it or stops
    active_by_agent: HashMap<String, String>,
    fine: Option<FineWatch>,
}

/// The watcher pool for one loaded workspace
pub struct WatcherPool {
    layout: LogLayout,
    tx: mpsc::UnboundedSender<WatchSignal>,
    state: Mutex<PoolState>,
    /// Session ids already announced per agent, shared with coarse callbacks
    announced: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl WatcherPool {
    pub fn new(layout: LogLayout, tx: mpsc::UnboundedSender<WatchSignal>) -> Self {
        Self {
            layout,
            tx,
            state: Mutex::new(PoolState::default()),
            announced: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begin coarse-watching an agent's log directory
    pub fn start_agent(&self, agent_id: &str, agent_name: &str, folder: &Path) -> Result<()> {
        let dir = self.layout.project_dir(folder);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log dir '{}'", dir.display()))?;

        let tx = self.tx.clone();
        let announced = Arc::clone(&self.announced);
        let id_for_events = agent_id.to_string();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in &event.paths {
                let Some(session_id) = session_id_from_path(path) else {
                    continue;
                };
                let fresh = announced
                    .lock()
                    .expect("announced set poisoned")
                    .entry(id_for_events.clone())
                    .or_default()
                    .insert(session_id.clone());
                if fresh {
                    let _ = tx.send(WatchSignal::SessionDiscovered {
                        agent_id: id_for_events.clone(),
                        session_id,
                        path: path.clone(),
                    });
                }
            }
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch '{}'", dir.display()))?;

        let mut state = self.state.lock().expect("pool state poisoned");
        state
            .folder_agents
            .entry(folder.to_path_buf())
            .or_default()
            .insert(agent_id.to_string());
        state.agents.insert(
            agent_id.to_string(),
            AgentWatch {
                folder: folder.to_path_buf(),
                name: agent_name.to_string(),
                _watcher: watcher,
            },
        );
        tracing::debug!(agent = agent_id, dir = %dir.display(), "started agent watch");
        Ok(())
    }

    /// Stop watching an agent. Other agents sharing the folder keep theirs.
    pub fn stop_agent(&self, agent_id: &str, folder: &Path) {
        let mut state = self.state.lock().expect("pool state poisoned");
        state.agents.remove(agent_id);
        if let Some(ids) = state.folder_agents.get_mut(folder) {
            ids.remove(agent_id);
            if ids.is_empty() {
                state.folder_agents.remove(folder);
            }
        }
        state.active_by_agent.remove(agent_id);
        if state
            .fine
            .as_ref()
            .map(|f| f.agent_id == agent_id)
            .unwrap_or(false)
        {
            state.fine = None;
        }
        self.announced
            .lock()
            .expect("announced set poisoned")
            .remove(agent_id);
    }

    /// Point the fine watch at a session. Fails when another agent sharing
    /// the folder already claims that session; the error names that agent.
    /// This is the single place the shared-folder conflict is checked.
    pub fn set_active_session(&self, agent_id: &str, session_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("pool state poisoned");
        let folder = state
            .agents
            .get(agent_id)
            .map(|w| w.folder.clone())
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;

        if let Some(peers) = state.folder_agents.get(&folder) {
            for peer in peers {
                if peer == agent_id {
                    continue;
                }
                if state.active_by_agent.get(peer).map(String::as_str) == Some(session_id) {
                    let peer_name = state
                        .agents
                        .get(peer)
                        .map(|w| w.name.clone())
                        .unwrap_or_else(|| peer.clone());
                    return Err(OrchestratorError::SessionActiveElsewhere {
                        session_id: session_id.to_string(),
                        agent_name: peer_name,
                    }
                    .into());
                }
            }
        }

        let path = self.layout.session_log(&folder, session_id);
        let paused = Arc::new(AtomicBool::new(false));
        let tx = self.tx.clone();
        let signal_agent = agent_id.to_string();
        let signal_session = session_id.to_string();
        let signal_path = path.clone();
        let paused_flag = Arc::clone(&paused);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            if paused_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(WatchSignal::SessionModified {
                agent_id: signal_agent.clone(),
                session_id: signal_session.clone(),
                path: signal_path.clone(),
            });
        })?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch '{}'", path.display()))?;

        // The previous fine watch tears down here; observers see a monotone
        // transition from old selection to new.
        state.fine = Some(FineWatch {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            paused,
            _watcher: watcher,
        });
        state
            .active_by_agent
            .insert(agent_id.to_string(), session_id.to_string());
        tracing::debug!(agent = agent_id, session = session_id, "fine watch attached");
        Ok(())
    }

    /// Drop the fine watch and the owning agent's claim
    pub fn clear_active_session(&self) {
        let mut state = self.state.lock().expect("pool state poisoned");
        if let Some(fine) = state.fine.take() {
            state.active_by_agent.remove(&fine.agent_id);
            tracing::debug!(agent = %fine.agent_id, session = %fine.session_id, "fine watch cleared");
        }
    }

    /// Suspend fine-watch notifications while a log file is patched
    pub fn pause_active(&self) {
        let state = self.state.lock().expect("pool state poisoned");
        if let Some(fine) = &state.fine {
            fine.paused.store(true, Ordering::SeqCst);
        }
    }

    pub fn resume_active(&self) {
        let state = self.state.lock().expect("pool state poisoned");
        if let Some(fine) = &state.fine {
            fine.paused.store(false, Ordering::SeqCst);
        }
    }

    /// Whether a fine watch currently targets `session_id`
    pub fn is_active(&self, session_id: &str) -> bool {
        let state = self.state.lock().expect("pool state poisoned");
        state
            .fine
            .as_ref()
            .map(|f| f.session_id == session_id)
            .unwrap_or(false)
    }

    /// Reconcile on-disk sessions with what has been announced; returns the
    /// number of newly discovered sessions
    pub fn rescan_sessions(&self, agent_id: &str, folder: &Path) -> usize {
        let on_disk = self.layout.scan_sessions(folder);
        let mut discovered = 0;
        let mut announced = self.announced.lock().expect("announced set poisoned");
        let known = announced.entry(agent_id.to_string()).or_default();
        for session_id in on_disk {
            if known.insert(session_id.clone()) {
                discovered += 1;
                let _ = self.tx.send(WatchSignal::SessionDiscovered {
                    agent_id: agent_id.to_string(),
                    session_id: session_id.clone(),
                    path: self.layout.session_log(folder, &session_id),
                });
            }
        }
        discovered
    }

    /// Ask the ingest loop to clear and re-read one session
    pub fn reload_session(&self, agent_id: &str, folder: &Path, session_id: &str) {
        let _ = self.tx.send(WatchSignal::SessionReload {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            path: self.layout.session_log(folder, session_id),
        });
    }

    /// Full teardown on workspace switch
    pub fn teardown(&self) {
        let mut state = self.state.lock().expect("pool state poisoned");
        state.fine = None;
        state.agents.clear();
        state.folder_agents.clear();
        state.active_by_agent.clear();
        self.announced
            .lock()
            .expect("announced set poisoned")
            .clear();
        tracing::debug!("watcher pool torn down");
    }
}

fn session_id_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn pool() -> (TempDir, WatcherPool, mpsc::UnboundedReceiver<WatchSignal>) {
        let dir = TempDir::new().unwrap();
        let layout = LogLayout::with_root(dir.path().to_path_buf());
        let (tx, rx) = mpsc::unbounded_channel();
        (dir, WatcherPool::new(layout, tx), rx)
    }

    #[tokio::test]
    async fn shared_folder_session_conflict_names_the_other_agent() {
        let (_dir, pool, _rx) = pool();
        let folder = PathBuf::from("/p");
        pool.start_agent("a-1", "Builder", &folder).unwrap();
        pool.start_agent("a-2", "Reviewer", &folder).unwrap();

        // The session file must exist for the fine watch
        let log = pool.layout.session_log(&folder, "s1");
        std::fs::write(&log, "").unwrap();

        pool.set_active_session("a-1", "s1").unwrap();
        let err = pool.set_active_session("a-2", "s1").unwrap_err();
        assert!(err.to_string().contains("Builder"), "got: {}", err);

        // A different session is fine
        std::fs::write(pool.layout.session_log(&folder, "s2"), "").unwrap();
        pool.set_active_session("a-2", "s2").unwrap();
    }

    #[tokio::test]
    async fn clear_releases_the_claim() {
        let (_dir, pool, _rx) = pool();
        let folder = PathBuf::from("/p");
        pool.start_agent("a-1", "Builder", &folder).unwrap();
        pool.start_agent("a-2", "Reviewer", &folder).unwrap();
        std::fs::write(pool.layout.session_log(&folder, "s1"), "").unwrap();

        pool.set_active_session("a-1", "s1").unwrap();
        assert!(pool.is_active("s1"));
        pool.clear_active_session();
        assert!(!pool.is_active("s1"));

        pool.set_active_session("a-2", "s1").unwrap();
    }

    #[tokio::test]
    async fn each_session_is_announced_exactly_once() {
        let (_dir, pool, mut rx) = pool();
        let folder = PathBuf::from("/p");
        pool.start_agent("a-1", "Builder", &folder).unwrap();

        std::fs::write(pool.layout.session_log(&folder, "s1"), "").unwrap();
        std::fs::write(pool.layout.session_log(&folder, "s2"), "").unwrap();

        // The live watcher and the rescan race to announce; between them,
        // each session must surface exactly once.
        pool.rescan_sessions("a-1", &folder);

        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.len() < 2 && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await {
                Ok(Some(WatchSignal::SessionDiscovered { session_id, .. })) => {
                    assert!(!seen.contains(&session_id), "duplicate announcement");
                    seen.push(session_id);
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["s1".to_string(), "s2".to_string()]);

        // A later rescan discovers nothing new
        assert_eq!(pool.rescan_sessions("a-1", &folder), 0);
    }

    #[tokio::test]
    async fn fine_watch_reports_modifications() {
        let (_dir, pool, mut rx) = pool();
        let folder = PathBuf::from("/p");
        pool.start_agent("a-1", "Builder", &folder).unwrap();

        let log = pool.layout.session_log(&folder, "s1");
        std::fs::write(&log, "").unwrap();
        pool.set_active_session("a-1", "s1").unwrap();

        std::fs::write(&log, "{\"type\":\"user\"}\n").unwrap();

        let signal = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(WatchSignal::SessionModified {
                        agent_id,
                        session_id,
                        ..
                    }) => break (agent_id, session_id),
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("no modification signal");
        assert_eq!(signal, ("a-1".to_string(), "s1".to_string()));
    }

    #[tokio::test]
    async fn paused_fine_watch_stays_silent() {
        let (_dir, pool, mut rx) = pool();
        let folder = PathBuf::from("/p");
        pool.start_agent("a-1", "Builder", &folder).unwrap();
        let log = pool.layout.session_log(&folder, "s1");
        std::fs::write(&log, "").unwrap();
        pool.set_active_session("a-1", "s1").unwrap();

        pool.pause_active();
        std::fs::write(&log, "data\n").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        while let Ok(signal) = rx.try_recv() {
            assert!(
                !matches!(signal, WatchSignal::SessionModified { .. }),
                "paused watch emitted a modification"
            );
        }
        pool.resume_active();
    }

    #[tokio::test]
    async fn reload_signal_round_trips() {
        let (_dir, pool, mut rx) = pool();
        let folder = PathBuf::from("/p");
        pool.reload_session("a-1", &folder, "s1");
        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal, WatchSignal::SessionReload { session_id, .. } if session_id == "s1"));
    }
}
