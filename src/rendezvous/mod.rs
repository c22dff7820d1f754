//! Blocking rendezvous between child tool calls and the view
//!
//! Three isomorphic managers (question, permission, plan review) share one
//! generic pending-request table. A tool handler creates a request, publishes
//! its event, then awaits the reply channel with a timeout; the view resolves
//! it through `respond`/`skip`, teardown through `cancel`/`cancel_all`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::utils::error::OrchestratorError;

/// Default wait for question and plan-review requests
pub const QUESTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Default wait for permission requests
pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// What the waiting tool handler observes
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    Answered(R),
    Skipped,
    Cancelled,
    TimedOut,
}

/// Value delivered over a reply channel
#[derive(Debug)]
pub enum Reply<R> {
    Answered(R),
    Skipped,
}

struct PendingEntry<P, R> {
    agent_slug: String,
    payload: P,
    created_at: DateTime<Utc>,
    tx: mpsc::Sender<Reply<R>>,
}

/// A pending request snapshot, for listing in the view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSnapshot<P: Clone> {
    pub id: String,
    pub agent_slug: String,
    pub payload: P,
    pub created_at: DateTime<Utc>,
}

/// Pending-request table generic over payload and reply types
pub struct PendingManager<P, R> {
    pending: Mutex<HashMap<String, PendingEntry<P, R>>>,
    timeout: Duration,
}

impl<P: Clone, R> PendingManager<P, R> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a request. Returns its id and the receiver the tool handler
    /// waits on. The channel is buffered (capacity 1) so responders never
    /// block.
    pub fn create(&self, agent_slug: &str, payload: P) -> (String, mpsc::Receiver<Reply<R>>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(1);
        let entry = PendingEntry {
            agent_slug: agent_slug.to_string(),
            payload,
            created_at: Utc::now(),
            tx,
        };
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(id.clone(), entry);
        (id, rx)
    }

    /// Await the reply for a request created with [`create`]. The entry is
    /// removed whatever the outcome, so each channel observes at most one
    /// value.
    pub async fn wait(&self, id: &str, mut rx: mpsc::Receiver<Reply<R>>) -> Outcome<R> {
        let outcome = match tokio::time::timeout(self.timeout, rx.recv()).await {
            Ok(Some(Reply::Answered(answer))) => Outcome::Answered(answer),
            Ok(Some(Reply::Skipped)) => Outcome::Skipped,
            // Sender dropped: the request was cancelled
            Ok(None) => Outcome::Cancelled,
            Err(_) => Outcome::TimedOut,
        };
        self.remove(id);
        outcome
    }

    /// Deliver the user's answer
    pub fn respond(&self, id: &str, answer: R) -> Result<(), OrchestratorError> {
        let entry = self
            .remove(id)
            .ok_or(OrchestratorError::RendezvousClosed)?;
        entry
            .tx
            .try_send(Reply::Answered(answer))
            .map_err(|_| OrchestratorError::RendezvousClosed)
    }

    /// Dismiss the request without an answer
    pub fn skip(&self, id: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .remove(id)
            .ok_or(OrchestratorError::RendezvousClosed)?;
        entry
            .tx
            .try_send(Reply::Skipped)
            .map_err(|_| OrchestratorError::RendezvousClosed)
    }

    /// Abort the request; the waiter observes `Cancelled`
    pub fn cancel(&self, id: &str) {
        self.remove(id);
    }

    /// Abort every outstanding request (workspace teardown)
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        let drained = pending.len();
        pending.clear();
        if drained > 0 {
            tracing::info!(count = drained, "cancelled outstanding requests");
        }
    }

    /// Snapshot of all outstanding requests
    pub fn list(&self) -> Vec<PendingSnapshot<P>> {
        let pending = self.pending.lock().expect("pending table poisoned");
        pending
            .iter()
            .map(|(id, entry)| PendingSnapshot {
                id: id.clone(),
                agent_slug: entry.agent_slug.clone(),
                payload: entry.payload.clone(),
                created_at: entry.created_at,
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .contains_key(id)
    }

    fn remove(&self, id: &str) -> Option<PendingEntry<P, R>> {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .remove(id)
    }
}

/// Question asked of the user on the child's behalf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRequest {
    /// Batch of questions, each with its options, passed through verbatim
    pub questions: Value,
}

/// The user's structured answers, keyed by question
pub type QuestionReply = Value;

/// Permission sought for a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionReply {
    pub granted: bool,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
}

/// Plan submitted for review before leaving planning mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReviewRequest {
    pub plan: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// The three managers, constructed together per workspace
pub struct RendezvousSet {
    pub questions: PendingManager<QuestionRequest, QuestionReply>,
    pub permissions: PendingManager<PermissionRequest, PermissionReply>,
    pub plans: PendingManager<PlanReviewRequest, PlanReply>,
}

impl RendezvousSet {
    pub fn new() -> Self {
        Self {
            questions: PendingManager::new(QUESTION_TIMEOUT),
            permissions: PendingManager::new(PERMISSION_TIMEOUT),
            plans: PendingManager::new(QUESTION_TIMEOUT),
        }
    }

    /// Close every outstanding channel across all three managers
    pub fn cancel_all(&self) {
        self.questions.cancel_all();
        self.permissions.cancel_all();
        self.plans.cancel_all();
    }
}

impl Default for RendezvousSet {
    fn default() -> Self {
        Self::new()
    }
}
