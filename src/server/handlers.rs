//! Tool call handlers
//!
//! Handlers fall in two groups: synchronous ones (inbox, backlog, notify,
//! fan-out queries) that finish on their own, and blocking ones (question,
//! permission, plan review) that publish a pending-request event and then
//! wait on the rendezvous reply channel. Every failure is returned as a tool
//! error to the calling child, never as a transport error.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::permissions::{PermissionFiles, ToolSettings, DEFAULT_DISALLOWED_TOOLS, REQUIRED_TOOLS};
use crate::config::{AgentConfig, WorkspaceStore};
use crate::events::{names, EventBus, EventEnvelope};
use crate::process::ChildProcessManager;
use crate::rendezvous::{
    Outcome, PermissionRequest, PlanReviewRequest, QuestionRequest, RendezvousSet,
};
use crate::store::backlog::render_xml;
use crate::store::{BacklogStatus, BacklogStore, BacklogType, BacklogUpdate, InboxStore, Priority};

use super::tools;

/// Result of one tool invocation, in the shape the MCP client expects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }
}

/// Live view of the loaded workspace, refreshed by the orchestrator
#[derive(Debug, Default)]
pub struct AgentDirectory {
    pub workspace_id: Option<String>,
    pub agents: Vec<AgentConfig>,
    pub env: HashMap<String, String>,
    pub additional_directories: Vec<PathBuf>,
}

impl AgentDirectory {
    pub fn agent_by_slug(&self, slug: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.slug == slug)
    }
}

/// Everything a tool handler may touch
#[derive(Clone)]
pub struct ToolContext {
    pub bus: EventBus,
    pub rendezvous: Arc<RendezvousSet>,
    pub inbox: Arc<RwLock<Option<Arc<InboxStore>>>>,
    pub backlogs: Arc<DashMap<String, Arc<BacklogStore>>>,
    pub children: Arc<ChildProcessManager>,
    pub permissions: Arc<PermissionFiles>,
    pub directory: Arc<RwLock<AgentDirectory>>,
    pub settings: Arc<RwLock<ToolSettings>>,
    pub registry: Arc<WorkspaceStore>,
    pub port: Arc<std::sync::OnceLock<u16>>,
}

impl ToolContext {
    /// Open (and lazily migrate) the backlog store for an agent
    pub async fn backlog_for(&self, agent_id: &str) -> anyhow::Result<Arc<BacklogStore>> {
        if let Some(store) = self.backlogs.get(agent_id) {
            return Ok(Arc::clone(&store));
        }
        let store = Arc::new(BacklogStore::open(
            &self.registry.backlog_db(agent_id),
            agent_id,
        )?);
        if let Some(workspace_id) = self.directory.read().await.workspace_id.clone() {
            store.migrate_from_workspace_db(&self.registry.legacy_backlog_db(&workspace_id))?;
        }
        self.backlogs.insert(agent_id.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

fn str_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

/// Execute one tool call. Disabled tools fail with a well-formed error
/// naming the tool; the two structurally required tools cannot be disabled.
pub async fn dispatch(ctx: &ToolContext, name: &str, args: Value) -> ToolResult {
    {
        let settings = ctx.settings.read().await;
        if !REQUIRED_TOOLS.contains(&name) && !settings.is_enabled(name) {
            return ToolResult::error(format!("Tool '{}' is disabled", name));
        }
    }

    tracing::info!(tool = name, from = ?str_arg(&args, "from_agent"), "tool call");

    match name {
        tools::AGENT_QUERY => agent_query(ctx, &args).await,
        tools::SELF_QUERY => self_query(ctx, &args).await,
        tools::AGENT_MESSAGE => agent_message(ctx, &args).await,
        tools::AGENT_BROADCAST => agent_broadcast(ctx, &args).await,
        tools::NOTIFY_USER => notify_user(ctx, &args).await,
        tools::ASK_USER_QUESTION => ask_user_question(ctx, &args).await,
        tools::REQUEST_TOOL_PERMISSION => request_tool_permission(ctx, &args).await,
        tools::EXIT_PLAN_MODE => exit_plan_mode(ctx, &args).await,
        tools::BACKLOG_ADD => backlog_add(ctx, &args).await,
        tools::BACKLOG_UPDATE => backlog_update(ctx, &args).await,
        tools::BACKLOG_LIST => backlog_list(ctx, &args).await,
        other => ToolResult::error(format!("Unknown tool: {}", other)),
    }
}

/// Target resolution shared by the query tools
async fn query_target(ctx: &ToolContext, slug: &str) -> Result<AgentConfig, ToolResult> {
    let directory = ctx.directory.read().await;
    directory
        .agent_by_slug(slug)
        .filter(|a| a.mcp_enabled)
        .cloned()
        .ok_or_else(|| ToolResult::error(format!("Agent '{}' not found or not available", slug)))
}

async fn run_query_for(ctx: &ToolContext, agent: &AgentConfig, prompt: &str) -> ToolResult {
    let permissions = match ctx.permissions.load(&agent.id).await {
        Ok(permissions) => permissions,
        Err(e) => return ToolResult::error(format!("Failed to load permissions: {}", e)),
    };
    let disallowed: Vec<String> = DEFAULT_DISALLOWED_TOOLS
        .iter()
        .map(|t| t.to_string())
        .collect();
    let env = ctx.directory.read().await.env.clone();

    match ctx
        .children
        .run_query(
            &agent.folder,
            prompt,
            &permissions.allowed_tools(),
            &disallowed,
            ctx.port.get().copied(),
            &env,
        )
        .await
    {
        Ok(stdout) => ToolResult::text(stdout),
        Err(e) => ToolResult::error(format!("Query failed: {:#}", e)),
    }
}

async fn agent_query(ctx: &ToolContext, args: &Value) -> ToolResult {
    let Some(slug) = str_arg(args, "agent") else {
        return ToolResult::error("Missing required parameter: agent");
    };
    let Some(prompt) = str_arg(args, "prompt") else {
        return ToolResult::error("Missing required parameter: prompt");
    };
    let agent = match query_target(ctx, &slug).await {
        Ok(found) => found,
        Err(err) => return err,
    };
    if let Some(from) = str_arg(args, "from_agent") {
        tracing::info!(from = %from, to = %slug, "inter-agent query");
    }
    run_query_for(ctx, &agent, &prompt).await
}

async fn self_query(ctx: &ToolContext, args: &Value) -> ToolResult {
    let Some(from) = str_arg(args, "from_agent") else {
        return ToolResult::error("SelfQuery requires from_agent");
    };
    let Some(prompt) = str_arg(args, "prompt") else {
        return ToolResult::error("Missing required parameter: prompt");
    };
    let agent = match query_target(ctx, &from).await {
        Ok(found) => found,
        Err(err) => return err,
    };
    run_query_for(ctx, &agent, &prompt).await
}

/// Resolve the sender's id and display name for inbox rows
async fn sender_identity(ctx: &ToolContext, args: &Value) -> (String, String) {
    let slug = str_arg(args, "from_agent");
    let directory = ctx.directory.read().await;
    match slug.as_deref().and_then(|s| directory.agent_by_slug(s)) {
        Some(agent) => (agent.id.clone(), agent.name.clone()),
        None => {
            let label = slug.unwrap_or_else(|| "external".to_string());
            (label.clone(), label)
        }
    }
}

async fn deliver_inbox(
    ctx: &ToolContext,
    recipients: Vec<AgentConfig>,
    args: &Value,
) -> ToolResult {
    let Some(message) = str_arg(args, "message") else {
        return ToolResult::error("Missing required parameter: message");
    };
    let priority = str_arg(args, "priority")
        .map(|p| Priority::parse(&p))
        .unwrap_or(Priority::Normal);
    let (from_id, from_name) = sender_identity(ctx, args).await;

    let inbox = ctx.inbox.read().await;
    let Some(store) = inbox.as_ref() else {
        return ToolResult::error("No workspace is loaded");
    };

    let mut delivered = Vec::new();
    for recipient in recipients {
        match store.insert(&from_id, &from_name, &recipient.id, &message, priority) {
            Ok(_) => {
                ctx.bus.publish(EventEnvelope::for_agent(
                    names::MCP_INBOX,
                    &recipient.id,
                    json!({"from": from_name, "priority": priority.as_str()}),
                ));
                delivered.push(recipient.slug.clone());
            }
            Err(e) => {
                tracing::error!(recipient = %recipient.slug, error = %e, "inbox insert failed");
            }
        }
    }

    if delivered.is_empty() {
        ToolResult::error("Message was not delivered to any agent")
    } else {
        ToolResult::text(format!("Message delivered to: {}", delivered.join(", ")))
    }
}

async fn agent_message(ctx: &ToolContext, args: &Value) -> ToolResult {
    let slugs: Vec<String> = match args.get("to") {
        Some(Value::String(slug)) => vec![slug.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.to_string())
            .collect(),
        _ => return ToolResult::error("Missing required parameter: to"),
    };

    let directory = ctx.directory.read().await;
    let mut recipients = Vec::new();
    let mut missing = Vec::new();
    for slug in &slugs {
        match directory.agent_by_slug(slug).filter(|a| a.mcp_enabled) {
            Some(agent) => recipients.push(agent.clone()),
            None => missing.push(slug.clone()),
        }
    }
    drop(directory);

    if !missing.is_empty() {
        return ToolResult::error(format!("Unknown agent(s): {}", missing.join(", ")));
    }
    deliver_inbox(ctx, recipients, args).await
}

async fn agent_broadcast(ctx: &ToolContext, args: &Value) -> ToolResult {
    let from = str_arg(args, "from_agent");
    let directory = ctx.directory.read().await;
    let recipients: Vec<AgentConfig> = directory
        .agents
        .iter()
        .filter(|a| a.mcp_enabled)
        .filter(|a| from.as_deref() != Some(a.slug.as_str()))
        .cloned()
        .collect();
    drop(directory);

    if recipients.is_empty() {
        return ToolResult::error("No agents available to broadcast to");
    }
    deliver_inbox(ctx, recipients, args).await
}

async fn notify_user(ctx: &ToolContext, args: &Value) -> ToolResult {
    let Some(message) = str_arg(args, "message") else {
        return ToolResult::error("Missing required parameter: message");
    };
    ctx.bus.publish(EventEnvelope::new(
        names::MCP_NOTIFICATION,
        json!({
            "title": str_arg(args, "title"),
            "message": message,
            "notificationType": str_arg(args, "notification_type").unwrap_or_else(|| "info".to_string()),
            "fromAgent": str_arg(args, "from_agent"),
        }),
    ));
    ToolResult::text("Notification sent")
}

async fn ask_user_question(ctx: &ToolContext, args: &Value) -> ToolResult {
    let Some(questions) = args.get("questions").cloned() else {
        return ToolResult::error("Missing required parameter: questions");
    };
    let slug = str_arg(args, "from_agent").unwrap_or_default();

    let (id, rx) = ctx.rendezvous.questions.create(
        &slug,
        QuestionRequest {
            questions: questions.clone(),
        },
    );
    ctx.bus.publish(EventEnvelope::new(
        names::MCP_ASK_USER,
        json!({"id": id, "agent": slug, "questions": questions}),
    ));

    match ctx.rendezvous.questions.wait(&id, rx).await {
        Outcome::Answered(answers) => ToolResult::text(
            serde_json::to_string_pretty(&answers).unwrap_or_else(|_| answers.to_string()),
        ),
        Outcome::Skipped => ToolResult::text("The user skipped the question."),
        Outcome::Cancelled => ToolResult::error("The question was cancelled before an answer"),
        Outcome::TimedOut => ToolResult::error("Timed out waiting for the user to answer"),
    }
}

async fn request_tool_permission(ctx: &ToolContext, args: &Value) -> ToolResult {
    let Some(tool_name) = str_arg(args, "tool_name") else {
        return ToolResult::error("Missing required parameter: tool_name");
    };
    let Some(slug) = str_arg(args, "from_agent") else {
        return ToolResult::error("RequestToolPermission requires from_agent");
    };
    let input = args.get("input").cloned().unwrap_or(Value::Null);

    let (id, rx) = ctx.rendezvous.permissions.create(
        &slug,
        PermissionRequest {
            tool_name: tool_name.clone(),
            input: input.clone(),
        },
    );
    ctx.bus.publish(EventEnvelope::new(
        names::MCP_PERMISSION_REQUEST,
        json!({"id": id, "agent": slug, "toolName": tool_name, "input": input}),
    ));

    match ctx.rendezvous.permissions.wait(&id, rx).await {
        Outcome::Answered(reply) => {
            if reply.granted && reply.permanent {
                let directory = ctx.directory.read().await;
                if let Some(agent) = directory.agent_by_slug(&slug) {
                    let agent_id = agent.id.clone();
                    drop(directory);
                    if let Err(e) = ctx.permissions.grant(&agent_id, &tool_name).await {
                        tracing::error!(error = %e, "failed to persist permanent grant");
                    }
                }
            }
            ToolResult::text(
                json!({
                    "granted": reply.granted,
                    "permanent": reply.permanent,
                    "denyReason": reply.deny_reason,
                })
                .to_string(),
            )
        }
        Outcome::Skipped => ToolResult::text(
            json!({"granted": false, "denyReason": "The user dismissed the request"}).to_string(),
        ),
        Outcome::Cancelled => ToolResult::error("The permission request was cancelled"),
        Outcome::TimedOut => ToolResult::error("Timed out waiting for a permission decision"),
    }
}

async fn exit_plan_mode(ctx: &ToolContext, args: &Value) -> ToolResult {
    let Some(plan) = str_arg(args, "plan") else {
        return ToolResult::error("Missing required parameter: plan");
    };
    let slug = str_arg(args, "from_agent").unwrap_or_default();

    let (id, rx) = ctx
        .rendezvous
        .plans
        .create(&slug, PlanReviewRequest { plan: plan.clone() });
    ctx.bus.publish(EventEnvelope::new(
        names::MCP_PLAN_REVIEW,
        json!({"id": id, "agent": slug, "plan": plan}),
    ));

    match ctx.rendezvous.plans.wait(&id, rx).await {
        Outcome::Answered(reply) => {
            if reply.accepted {
                ToolResult::text(json!({"accepted": true}).to_string())
            } else {
                ToolResult::text(
                    json!({"accepted": false, "feedback": reply.feedback}).to_string(),
                )
            }
        }
        Outcome::Skipped => ToolResult::text("The user skipped the plan review."),
        Outcome::Cancelled => ToolResult::error("The plan review was cancelled"),
        Outcome::TimedOut => ToolResult::error("Timed out waiting for the plan review"),
    }
}

/// Resolve the required `from_agent` slug to its agent for backlog tools
async fn backlog_owner(ctx: &ToolContext, args: &Value) -> Result<AgentConfig, ToolResult> {
    let Some(slug) = str_arg(args, "from_agent") else {
        return Err(ToolResult::error("Backlog tools require from_agent"));
    };
    let directory = ctx.directory.read().await;
    directory
        .agent_by_slug(&slug)
        .cloned()
        .ok_or_else(|| ToolResult::error(format!("Agent '{}' not found", slug)))
}

async fn backlog_add(ctx: &ToolContext, args: &Value) -> ToolResult {
    let agent = match backlog_owner(ctx, args).await {
        Ok(agent) => agent,
        Err(err) => return err,
    };
    let Some(title) = str_arg(args, "title") else {
        return ToolResult::error("Missing required parameter: title");
    };

    let status = str_arg(args, "status")
        .and_then(|s| BacklogStatus::parse(&s))
        .unwrap_or(BacklogStatus::Idea);
    let item_type = str_arg(args, "type")
        .and_then(|s| BacklogType::parse(&s))
        .unwrap_or(BacklogType::Improvement);

    let store = match ctx.backlog_for(&agent.id).await {
        Ok(store) => store,
        Err(e) => return ToolResult::error(format!("Backlog unavailable: {}", e)),
    };
    match store.add(
        str_arg(args, "parent_id").as_deref(),
        &title,
        &str_arg(args, "context").unwrap_or_default(),
        status,
        item_type,
        &str_arg(args, "tags").unwrap_or_default(),
        &agent.slug,
    ) {
        Ok(item) => {
            ctx.bus.publish(EventEnvelope::for_agent(
                names::BACKLOG_CHANGED,
                &agent.id,
                json!({"id": item.id}),
            ));
            ToolResult::text(format!("Added backlog item {}", item.id))
        }
        Err(e) => ToolResult::error(format!("BacklogAdd failed: {}", e)),
    }
}

async fn backlog_update(ctx: &ToolContext, args: &Value) -> ToolResult {
    let agent = match backlog_owner(ctx, args).await {
        Ok(agent) => agent,
        Err(err) => return err,
    };
    let Some(id) = str_arg(args, "id") else {
        return ToolResult::error("Missing required parameter: id");
    };

    // `append:` asks for appending to the existing context
    let (context, append_context) = match str_arg(args, "context") {
        Some(raw) => match raw.strip_prefix("append:") {
            Some(rest) => (Some(rest.trim_start().to_string()), true),
            None => (Some(raw), false),
        },
        None => (None, false),
    };

    let update = BacklogUpdate {
        title: str_arg(args, "title"),
        context,
        append_context,
        status: str_arg(args, "status").and_then(|s| BacklogStatus::parse(&s)),
        item_type: str_arg(args, "type").and_then(|s| BacklogType::parse(&s)),
        tags: str_arg(args, "tags"),
    };

    let store = match ctx.backlog_for(&agent.id).await {
        Ok(store) => store,
        Err(e) => return ToolResult::error(format!("Backlog unavailable: {}", e)),
    };
    match store.update(&id, update) {
        Ok(item) => {
            ctx.bus.publish(EventEnvelope::for_agent(
                names::BACKLOG_CHANGED,
                &agent.id,
                json!({"id": item.id}),
            ));
            ToolResult::text(format!("Updated backlog item {}", item.id))
        }
        Err(e) => ToolResult::error(format!("BacklogUpdate failed: {}", e)),
    }
}

async fn backlog_list(ctx: &ToolContext, args: &Value) -> ToolResult {
    let agent = match backlog_owner(ctx, args).await {
        Ok(agent) => agent,
        Err(err) => return err,
    };
    let store = match ctx.backlog_for(&agent.id).await {
        Ok(store) => store,
        Err(e) => return ToolResult::error(format!("Backlog unavailable: {}", e)),
    };
    let status_filter = str_arg(args, "status").and_then(|s| BacklogStatus::parse(&s));
    match store.list() {
        Ok(items) => {
            let filtered: Vec<_> = match status_filter {
                Some(status) => items.into_iter().filter(|i| i.status == status).collect(),
                None => items,
            };
            ToolResult::text(render_xml(&filtered))
        }
        Err(e) => ToolResult::error(format!("BacklogList failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::permissions::PermissionFiles;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn context() -> (TempDir, ToolContext) {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(WorkspaceStore::with_root(dir.path().to_path_buf()));

        let mut builder = AgentConfig::new("Builder", dir.path().join("builder"));
        builder.description = Some("Owns the build".to_string());
        let reviewer = AgentConfig::new("Reviewer", dir.path().join("reviewer"));

        let directory = AgentDirectory {
            workspace_id: Some("ws-1".to_string()),
            agents: vec![builder, reviewer],
            env: HashMap::new(),
            additional_directories: Vec::new(),
        };

        let ctx = ToolContext {
            bus: EventBus::default(),
            rendezvous: Arc::new(RendezvousSet::new()),
            inbox: Arc::new(RwLock::new(Some(Arc::new(
                InboxStore::open_in_memory().unwrap(),
            )))),
            backlogs: Arc::new(DashMap::new()),
            children: Arc::new(ChildProcessManager::new("claude")),
            permissions: Arc::new(PermissionFiles::new(dir.path().to_path_buf())),
            directory: Arc::new(RwLock::new(directory)),
            settings: Arc::new(RwLock::new(ToolSettings::default())),
            registry,
            port: Arc::new(std::sync::OnceLock::new()),
        };
        (dir, ctx)
    }

    fn result_text(result: &ToolResult) -> &str {
        let ToolContent::Text { text } = &result.content[0];
        text
    }

    #[tokio::test]
    async fn disabled_tool_errors_by_name() {
        let (_dir, ctx) = context();
        ctx.settings.write().await.disabled.insert(tools::AGENT_QUERY.to_string());

        let result = dispatch(&ctx, tools::AGENT_QUERY, json!({})).await;
        assert!(result.is_error);
        assert_eq!(result_text(&result), "Tool 'AgentQuery' is disabled");
    }

    #[tokio::test]
    async fn required_tools_ignore_disable_flags() {
        let (_dir, ctx) = context();
        ctx.settings
            .write()
            .await
            .disabled
            .insert(tools::ASK_USER_QUESTION.to_string());

        // The call proceeds to the rendezvous path (and fails on missing
        // params), proving the disable flag was not honored.
        let result = dispatch(&ctx, tools::ASK_USER_QUESTION, json!({})).await;
        assert_eq!(result_text(&result), "Missing required parameter: questions");
    }

    #[tokio::test]
    async fn agent_message_lands_in_inbox_and_emits_event() {
        let (_dir, ctx) = context();
        let mut events = ctx.bus.subscribe();

        let result = dispatch(
            &ctx,
            tools::AGENT_MESSAGE,
            json!({"to": "reviewer", "message": "please review", "from_agent": "builder", "priority": "high"}),
        )
        .await;
        assert!(!result.is_error, "{:?}", result);

        let reviewer_id = ctx
            .directory
            .read()
            .await
            .agent_by_slug("reviewer")
            .unwrap()
            .id
            .clone();
        let inbox = ctx.inbox.read().await;
        let messages = inbox.as_ref().unwrap().list_for_agent(&reviewer_id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "please review");
        assert_eq!(messages[0].priority, Priority::High);
        assert_eq!(messages[0].from_agent_name, "Builder");

        let event = events.recv().await.unwrap();
        assert_eq!(event.event, names::MCP_INBOX);
        assert_eq!(event.agent_id.as_deref(), Some(reviewer_id.as_str()));
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let (_dir, ctx) = context();
        let result = dispatch(
            &ctx,
            tools::AGENT_BROADCAST,
            json!({"message": "standup time", "from_agent": "builder"}),
        )
        .await;
        assert!(!result.is_error);
        assert!(result_text(&result).contains("reviewer"));
        assert!(!result_text(&result).contains("builder"));
    }

    #[tokio::test]
    async fn unknown_recipient_is_an_error() {
        let (_dir, ctx) = context();
        let result = dispatch(
            &ctx,
            tools::AGENT_MESSAGE,
            json!({"to": "nobody", "message": "hi"}),
        )
        .await;
        assert!(result.is_error);
        assert!(result_text(&result).contains("nobody"));
    }

    #[tokio::test]
    async fn question_roundtrip_through_rendezvous() {
        let (_dir, ctx) = context();
        let mut events = ctx.bus.subscribe();

        let call = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                dispatch(
                    &ctx,
                    tools::ASK_USER_QUESTION,
                    json!({"questions": [{"question": "Proceed?"}], "from_agent": "builder"}),
                )
                .await
            }
        });

        // The view receives the pending-request event and answers
        let event = events.recv().await.unwrap();
        assert_eq!(event.event, names::MCP_ASK_USER);
        let id = event.payload["id"].as_str().unwrap().to_string();
        ctx.rendezvous
            .questions
            .respond(&id, json!({"Proceed?": "yes"}))
            .unwrap();

        let result = call.await.unwrap();
        assert!(!result.is_error);
        assert!(result_text(&result).contains("yes"));
    }

    #[tokio::test]
    async fn permanent_permission_grant_is_persisted() {
        let (_dir, ctx) = context();
        let mut events = ctx.bus.subscribe();

        let call = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                dispatch(
                    &ctx,
                    tools::REQUEST_TOOL_PERMISSION,
                    json!({"tool_name": "Bash(npm:*)", "from_agent": "builder"}),
                )
                .await
            }
        });

        let event = events.recv().await.unwrap();
        assert_eq!(event.event, names::MCP_PERMISSION_REQUEST);
        let id = event.payload["id"].as_str().unwrap().to_string();
        ctx.rendezvous
            .permissions
            .respond(
                &id,
                crate::rendezvous::PermissionReply {
                    granted: true,
                    permanent: true,
                    deny_reason: None,
                },
            )
            .unwrap();

        let result = call.await.unwrap();
        assert!(!result.is_error);
        assert!(result_text(&result).contains("\"granted\":true"));

        let builder_id = ctx
            .directory
            .read()
            .await
            .agent_by_slug("builder")
            .unwrap()
            .id
            .clone();
        let permissions = ctx.permissions.load(&builder_id).await.unwrap();
        assert!(permissions
            .allowed_tools()
            .contains(&"Bash(npm:*)".to_string()));
    }

    #[tokio::test]
    async fn plan_rejection_carries_feedback() {
        let (_dir, ctx) = context();
        let mut events = ctx.bus.subscribe();

        let call = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                dispatch(
                    &ctx,
                    tools::EXIT_PLAN_MODE,
                    json!({"plan": "1. rewrite everything", "from_agent": "builder"}),
                )
                .await
            }
        });

        let event = events.recv().await.unwrap();
        let id = event.payload["id"].as_str().unwrap().to_string();
        ctx.rendezvous
            .plans
            .respond(
                &id,
                crate::rendezvous::PlanReply {
                    accepted: false,
                    feedback: Some("too broad".to_string()),
                },
            )
            .unwrap();

        let result = call.await.unwrap();
        assert!(!result.is_error);
        assert!(result_text(&result).contains("too broad"));
    }

    #[tokio::test]
    async fn backlog_add_update_list_roundtrip() {
        let (_dir, ctx) = context();

        let added = dispatch(
            &ctx,
            tools::BACKLOG_ADD,
            json!({"from_agent": "builder", "title": "Fix flaky test", "type": "bug_fix", "context": "Seen in CI"}),
        )
        .await;
        assert!(!added.is_error, "{:?}", added);
        let id = result_text(&added)
            .rsplit(' ')
            .next()
            .unwrap()
            .to_string();

        let updated = dispatch(
            &ctx,
            tools::BACKLOG_UPDATE,
            json!({"from_agent": "builder", "id": id, "context": "append: repro found", "status": "in_progress"}),
        )
        .await;
        assert!(!updated.is_error, "{:?}", updated);

        let listed = dispatch(
            &ctx,
            tools::BACKLOG_LIST,
            json!({"from_agent": "builder", "status": "in_progress"}),
        )
        .await;
        assert!(!listed.is_error);
        let xml = result_text(&listed);
        assert!(xml.contains("Fix flaky test"));
        assert!(xml.contains("Seen in CI\nrepro found"));
        assert!(xml.contains("status=\"in_progress\""));
    }

    #[tokio::test]
    async fn backlog_requires_from_agent() {
        let (_dir, ctx) = context();
        let result = dispatch(&ctx, tools::BACKLOG_ADD, json!({"title": "orphan"})).await;
        assert!(result.is_error);
        assert!(result_text(&result).contains("from_agent"));
    }

    #[tokio::test]
    async fn notify_user_publishes_event() {
        let (_dir, ctx) = context();
        let mut events = ctx.bus.subscribe();

        let result = dispatch(
            &ctx,
            tools::NOTIFY_USER,
            json!({"message": "build green", "notification_type": "success"}),
        )
        .await;
        assert!(!result.is_error);

        let event = events.recv().await.unwrap();
        assert_eq!(event.event, names::MCP_NOTIFICATION);
        assert_eq!(event.payload["message"], "build green");
    }
}
