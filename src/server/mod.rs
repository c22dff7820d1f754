//! Local tool server: MCP over server-sent events
//!
//! Every child is launched with a config pointing here. `GET /sse` opens the
//! event stream and announces the per-connection message endpoint; JSON-RPC
//! requests arrive as `POST /message?sessionId=...` and are answered over
//! the stream. Blocking tool calls run in their own task so a pending
//! question never stalls the transport.

pub mod handlers;
pub mod jsonrpc;
pub mod tools;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use self::jsonrpc::{JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};

pub use self::handlers::{AgentDirectory, ToolContext, ToolResult};

/// Per-connection outbound channel capacity
const CONNECTION_BUFFER: usize = 64;

#[derive(Clone)]
struct ServerState {
    ctx: ToolContext,
    connections: Arc<DashMap<String, mpsc::Sender<String>>>,
}

/// A running tool server
pub struct ToolServerHandle {
    pub port: u16,
    task: tokio::task::JoinHandle<()>,
}

impl ToolServerHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ToolServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind to an ephemeral local port and serve. The chosen port is recorded in
/// the context so child invocations can point at it.
pub async fn start(ctx: ToolContext) -> Result<ToolServerHandle> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("Failed to bind tool server")?;
    let port = listener.local_addr()?.port();
    let _ = ctx.port.set(port);

    let state = ServerState {
        ctx,
        connections: Arc::new(DashMap::new()),
    };

    let app = Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "tool server exited");
        }
    });

    tracing::info!(port, "tool server listening");
    Ok(ToolServerHandle { port, task })
}

async fn sse_handler(
    State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<String>(CONNECTION_BUFFER);
    state.connections.insert(connection_id.clone(), tx);
    tracing::debug!(connection = %connection_id, "sse client connected");

    // First event tells the client where to POST its requests
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={}", connection_id));
    let first = stream::once(async move { Ok::<_, Infallible>(endpoint) });

    let rest = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|payload| {
            (
                Ok::<_, Infallible>(Event::default().event("message").data(payload)),
                rx,
            )
        })
    });

    Sse::new(first.chain(rest)).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn message_handler(
    State(state): State<ServerState>,
    Query(query): Query<MessageQuery>,
    Json(body): Json<Value>,
) -> StatusCode {
    let Some(tx) = state
        .connections
        .get(&query.session_id)
        .map(|entry| entry.value().clone())
    else {
        tracing::warn!(connection = %query.session_id, "message for unknown sse connection");
        return StatusCode::NOT_FOUND;
    };

    let message: JsonRpcMessage = match serde_json::from_value(body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable rpc message");
            return StatusCode::BAD_REQUEST;
        }
    };

    match message {
        JsonRpcMessage::Notification(notification) => {
            tracing::debug!(method = %notification.method, "rpc notification");
            StatusCode::ACCEPTED
        }
        JsonRpcMessage::Request(request) => {
            // Responses always travel over the SSE stream; tool calls may
            // block on the user for minutes, so each runs in its own task.
            let ctx = state.ctx.clone();
            let connections = Arc::clone(&state.connections);
            let connection_id = query.session_id.clone();
            tokio::spawn(async move {
                let response = handle_request(&ctx, request).await;
                match serde_json::to_string(&response) {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            tracing::debug!("sse client went away before the response");
                            connections.remove(&connection_id);
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode rpc response"),
                }
            });
            StatusCode::ACCEPTED
        }
    }
}

async fn handle_request(ctx: &ToolContext, request: JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            request.id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "claudefu",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => JsonRpcResponse::success(request.id, json!({})),
        "tools/list" => {
            let settings = ctx.settings.read().await;
            let directory = ctx.directory.read().await;
            let catalog = tools::catalog(&settings, &directory.agents);
            JsonRpcResponse::success(request.id, json!({"tools": catalog}))
        }
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::invalid_params("tools/call requires a name".to_string()),
                );
            };
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));

            let result = handlers::dispatch(ctx, name, arguments).await;
            match serde_json::to_value(&result) {
                Ok(value) => JsonRpcResponse::success(request.id, value),
                Err(e) => JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::internal(format!("Failed to encode tool result: {}", e)),
                ),
            }
        }
        other => JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::permissions::{PermissionFiles, ToolSettings};
    use crate::config::WorkspaceStore;
    use crate::events::EventBus;
    use crate::process::ChildProcessManager;
    use crate::rendezvous::RendezvousSet;
    use crate::store::InboxStore;
    use super::jsonrpc::RequestId;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    fn test_context(dir: &TempDir) -> ToolContext {
        ToolContext {
            bus: EventBus::default(),
            rendezvous: Arc::new(RendezvousSet::new()),
            inbox: Arc::new(RwLock::new(Some(Arc::new(
                InboxStore::open_in_memory().unwrap(),
            )))),
            backlogs: Arc::new(DashMap::new()),
            children: Arc::new(ChildProcessManager::new("claude")),
            permissions: Arc::new(PermissionFiles::new(dir.path().to_path_buf())),
            directory: Arc::new(RwLock::new(AgentDirectory {
                workspace_id: Some("ws-1".to_string()),
                agents: Vec::new(),
                env: HashMap::new(),
                additional_directories: Vec::new(),
            })),
            settings: Arc::new(RwLock::new(ToolSettings::default())),
            registry: Arc::new(WorkspaceStore::with_root(dir.path().to_path_buf())),
            port: Arc::new(std::sync::OnceLock::new()),
        }
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: jsonrpc::JSONRPC_VERSION.to_string(),
            id: RequestId::Number(1),
            method: method.to_string(),
            params: Some(params),
        }
    }

    #[tokio::test]
    async fn initialize_reports_tool_capability() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let response = handle_request(&ctx, request("initialize", json!({}))).await;
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "claudefu");
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_returns_catalog() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let response = handle_request(&ctx, request("tools/list", json!({}))).await;
        let result = response.result.unwrap();
        let names: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&tools::ASK_USER_QUESTION));
        assert!(names.contains(&tools::BACKLOG_LIST));
    }

    #[tokio::test]
    async fn tools_call_wraps_handler_result() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let response = handle_request(
            &ctx,
            request(
                "tools/call",
                json!({"name": "NotifyUser", "arguments": {"message": "hi"}}),
            ),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], false);
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let response = handle_request(&ctx, request("resources/list", json!({}))).await;
        assert!(response.error.is_some());
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn server_binds_an_ephemeral_port() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let port_cell = Arc::clone(&ctx.port);
        let handle = start(ctx).await.unwrap();
        assert!(handle.port > 0);
        assert_eq!(port_cell.get().copied(), Some(handle.port));
        handle.stop();
    }
}
