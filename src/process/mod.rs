//! External assistant child processes
//!
//! One child runs per active send, not per session: children are short-lived
//! and the conversation state lives in the log file they append to. The
//! manager builds invocations, tracks running children by session, delivers
//! interrupts, and retries known-transient failures.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::utils::error::OrchestratorError;

/// Failure substrings the assistant emits on transient conditions. A
/// heuristic layered on top of the exit-status check, never the primary
/// decision.
const TRANSIENT_MARKERS: &[&str] = &["concurrency issue", "tool_use ids must be unique"];

/// Maximum retry attempts for transient failures
const MAX_RETRIES: u32 = 3;

/// Linear backoff base between retries
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Timeout for stateless fan-out queries
const QUERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything needed to launch one send
#[derive(Debug, Clone)]
pub struct SendInvocation {
    pub session_id: String,
    pub folder: PathBuf,
    pub prompt: String,
    pub attachments: Vec<PathBuf>,
    /// Continue the existing session rather than starting a new one
    pub resume: bool,
    /// Emit the planning-mode directive for this send
    pub planning: bool,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub additional_directories: Vec<PathBuf>,
    /// User-configured environment; wins over the parent environment
    pub env: HashMap<String, String>,
    /// Local tool server port, when the agent is MCP-enabled
    pub mcp_port: Option<u16>,
}

/// Terminal result of one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    pub cancelled: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
struct ChildHandle {
    pid: Option<u32>,
}

/// Owns the external assistant children
pub struct ChildProcessManager {
    binary: String,
    children: DashMap<String, ChildHandle>,
    cancelled: DashMap<String, ()>,
}

impl ChildProcessManager {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            children: DashMap::new(),
            cancelled: DashMap::new(),
        }
    }

    /// Whether a child is currently running for this session
    pub fn is_running(&self, session_id: &str) -> bool {
        self.children.contains_key(session_id)
    }

    /// Consume the one-shot cancelled flag for a session
    pub fn take_cancelled(&self, session_id: &str) -> bool {
        self.cancelled.remove(session_id).is_some()
    }

    /// Deliver an interrupt to the session's child. No synthetic record is
    /// written to the log; the in-flight `run_send` observes the cancel on
    /// its next `wait` return.
    pub fn cancel(&self, session_id: &str) -> bool {
        let pid = match self.children.get(session_id) {
            Some(handle) => handle.pid,
            None => {
                tracing::debug!(session = session_id, "cancel requested but no child running");
                return false;
            }
        };
        self.cancelled.insert(session_id.to_string(), ());

        #[cfg(unix)]
        if let Some(pid) = pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                Ok(()) => {
                    tracing::info!(session = session_id, pid, "interrupt delivered");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(session = session_id, pid, error = %e, "failed to signal child");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            tracing::warn!(session = session_id, "cancel is only signal-based on unix");
        }
        false
    }

    /// Run one send to completion, retrying transient failures. The returned
    /// outcome is the authoritative completion signal; callers emit
    /// `response_complete` from it, never from mid-stream stop reasons.
    pub async fn run_send(&self, invocation: &SendInvocation) -> Result<SendOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.run_once(invocation).await?;

            if outcome.cancelled || outcome.success {
                return Ok(outcome);
            }
            let transient = outcome
                .error
                .as_deref()
                .map(is_transient_failure)
                .unwrap_or(false);
            if !transient || attempt > MAX_RETRIES {
                return Ok(outcome);
            }

            let backoff = RETRY_BACKOFF * attempt;
            tracing::warn!(
                session = %invocation.session_id,
                attempt,
                delay_ms = backoff.as_millis() as u64,
                "transient child failure, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_once(&self, invocation: &SendInvocation) -> Result<SendOutcome> {
        let use_stdin = !invocation.attachments.is_empty();
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&invocation.folder)
            .args(self.build_send_args(invocation, use_stdin))
            .envs(&invocation.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if use_stdin {
            cmd.stdin(Stdio::piped());
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::from(OrchestratorError::ChildMissing(self.binary.clone()))
            } else {
                anyhow::Error::from(e).context("Failed to spawn assistant child")
            }
        })?;

        self.children
            .insert(invocation.session_id.clone(), ChildHandle { pid: child.id() });

        if use_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let body = stdin_payload(invocation);
                stdin
                    .write_all(body.as_bytes())
                    .await
                    .context("Failed to stream prompt to child")?;
                drop(stdin);
            }
        }

        // wait_with_output drains stdout/stderr concurrently with the wait
        let waited = child.wait_with_output().await;

        self.children.remove(&invocation.session_id);
        let was_cancelled = self.take_cancelled(&invocation.session_id);

        let output = waited.context("Failed to wait for assistant child")?;
        let elapsed = start.elapsed();
        tracing::debug!(
            session = %invocation.session_id,
            elapsed_ms = elapsed.as_millis() as u64,
            status = ?output.status.code(),
            "child exited"
        );

        if was_cancelled {
            return Ok(SendOutcome {
                // The child may have finished its work before the interrupt
                // landed; exit status decides.
                success: output.status.success(),
                cancelled: true,
                error: None,
            });
        }

        if output.status.success() {
            return Ok(SendOutcome {
                success: true,
                cancelled: false,
                error: None,
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let error = format!(
            "Assistant exited with {:?}: {}",
            output.status.code(),
            if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            }
        );
        Ok(SendOutcome {
            success: false,
            cancelled: false,
            error: Some(error),
        })
    }

    /// Run a fresh, stateless child and return its stdout verbatim. Used by
    /// the inter-agent query tools; the conversation log is not touched.
    pub async fn run_query(
        &self,
        folder: &PathBuf,
        prompt: &str,
        allowed_tools: &[String],
        disallowed_tools: &[String],
        mcp_port: Option<u16>,
        env: &HashMap<String, String>,
    ) -> Result<String> {
        let mut args = vec!["-p".to_string(), prompt.to_string()];
        push_tool_args(&mut args, allowed_tools, disallowed_tools);
        if let Some(port) = mcp_port {
            args.push("--mcp-config".to_string());
            args.push(mcp_config(port));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(folder).args(&args).envs(env);

        let output = tokio::time::timeout(QUERY_TIMEOUT, cmd.output())
            .await
            .context("Assistant query timed out")?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    anyhow::Error::from(OrchestratorError::ChildMissing(self.binary.clone()))
                } else {
                    anyhow::Error::from(e).context("Failed to execute assistant query")
                }
            })?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            if stdout.trim().is_empty() {
                // The assistant sometimes reports on stderr even on success
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                if !stderr.trim().is_empty() {
                    return Ok(stderr);
                }
            }
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Assistant query failed (exit code: {:?}): {}",
                output.status.code(),
                stderr.trim()
            )
        }
    }

    fn build_send_args(&self, invocation: &SendInvocation, prompt_via_stdin: bool) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        // `-p` puts the child in non-interactive mode; with attachments the
        // prompt arrives on stdin instead, so the bare flag is spelled out.
        if prompt_via_stdin {
            args.push("--print".to_string());
        }

        if invocation.resume {
            args.push("--resume".to_string());
            args.push(invocation.session_id.clone());
        } else {
            args.push("--session-id".to_string());
            args.push(invocation.session_id.clone());
        }

        if invocation.planning {
            args.push("--permission-mode".to_string());
            args.push("plan".to_string());
        }

        push_tool_args(&mut args, &invocation.allowed_tools, &invocation.disallowed_tools);

        for dir in dedup_dirs(&invocation.additional_directories) {
            args.push("--add-dir".to_string());
            args.push(dir.to_string_lossy().to_string());
        }

        if let Some(port) = invocation.mcp_port {
            args.push("--mcp-config".to_string());
            args.push(mcp_config(port));
        }

        if !prompt_via_stdin {
            args.push("-p".to_string());
            args.push(invocation.prompt.clone());
        }

        args
    }
}

/// Exactly one allow-list and one deny-list argument. Emitting the list
/// twice under different spellings makes the child silently keep only one.
fn push_tool_args(args: &mut Vec<String>, allowed: &[String], disallowed: &[String]) {
    if !allowed.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(allowed.join(","));
    }
    if !disallowed.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(disallowed.join(","));
    }
}

/// Tool-server configuration handed to the child
fn mcp_config(port: u16) -> String {
    json!({
        "mcpServers": {
            "claudefu": {
                "type": "sse",
                "url": format!("http://127.0.0.1:{}/sse", port)
            }
        }
    })
    .to_string()
}

/// Union of directories, first occurrence wins
fn dedup_dirs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    dirs.iter()
        .filter(|d| seen.insert((*d).clone()))
        .cloned()
        .collect()
}

/// Prompt plus attachment references, streamed over stdin
fn stdin_payload(invocation: &SendInvocation) -> String {
    let mut body = invocation.prompt.clone();
    for attachment in &invocation.attachments {
        body.push_str(&format!("\n@{}", attachment.display()));
    }
    body.push('\n');
    body
}

fn is_transient_failure(error: &str) -> bool {
    let lowered = error.to_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(&marker.to_lowercase()))
}
