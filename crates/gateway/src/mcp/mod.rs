//! The gateway's own MCP endpoint.
//!
//! Serves streamable HTTP directly on axum: `POST /mcp` carries JSON-RPC
//! requests, `GET /mcp` opens the standalone SSE stream used for
//! `notifications/tools/list_changed`, `DELETE /mcp` ends a session. Request
//! headers reach the meta-tool layer as an explicit argument; there is no
//! ambient per-request state.

pub mod meta_tools;

use crate::error::{ErrorCode, error_body};
use crate::hooks::HookRunner;
use crate::registry::ToolRegistry;
use crate::server::Instructions;
use crate::upstream::UpstreamManager;
use axum::{
    Extension, Json,
    body::{Body, Bytes},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures::FutureExt as _;
use parking_lot::{Mutex, RwLock};
use rmcp::model::{ClientJsonRpcMessage, ClientRequest, JsonRpcRequest};
use rmcp::transport::common::http_header::{EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared state behind the MCP endpoint.
pub struct McpState {
    pub registry: Arc<ToolRegistry>,
    pub manager: Arc<UpstreamManager>,
    pub hooks: Arc<HookRunner>,
    pub sessions: Arc<SessionRegistry>,
    pub instructions: Arc<Instructions>,
    pub server_name: String,
}

struct Session {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

/// Client sessions and their notification channels.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().insert(
            id.clone(),
            Session {
                tx,
                rx: Mutex::new(Some(rx)),
            },
        );
        id
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    /// Claim the standalone stream for a session. `None` when the session is
    /// unknown or the stream was already taken.
    pub fn take_receiver(&self, id: &str) -> Option<mpsc::UnboundedReceiver<String>> {
        self.sessions.read().get(id)?.rx.lock().take()
    }

    /// Broadcast `notifications/tools/list_changed`, pruning dead sessions.
    pub fn notify_tools_list_changed(&self) {
        let message =
            json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}).to_string();

        let mut dead: Vec<String> = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                if session.tx.send(message.clone()).is_err() {
                    dead.push(id.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut sessions = self.sessions.write();
            for id in dead {
                sessions.remove(&id);
            }
        }
    }
}

/// Definitions of the four meta-tools, in MCP `tools/list` shape.
#[must_use]
pub fn meta_tool_definitions() -> Value {
    json!([
        {
            "name": "discover_tools",
            "description": "Browse the tools available through this gateway. \
                With no arguments, returns a summary of every domain. Pass \
                `domain` to list that domain's tools, add `group` to narrow \
                to a sub-category, or pass `query` alone to search across \
                all domains by name and description.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "domain": {"type": "string", "description": "Domain to list tools for"},
                    "group": {"type": "string", "description": "Group within the domain"},
                    "query": {"type": "string", "description": "Substring to search for"}
                },
                "additionalProperties": false
            }
        },
        {
            "name": "get_tool_schema",
            "description": "Fetch one tool's parameter schema before calling \
                it with execute_tool. Near-miss names resolve automatically \
                when unambiguous; otherwise suggestions are returned.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool_name": {"type": "string", "description": "Name returned by discover_tools"}
                },
                "required": ["tool_name"],
                "additionalProperties": false
            }
        },
        {
            "name": "execute_tool",
            "description": "Execute a discovered tool with the given \
                arguments. Use get_tool_schema first to learn the expected \
                parameters.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool_name": {"type": "string", "description": "Exact tool name"},
                    "arguments": {"type": "object", "description": "Tool arguments"}
                },
                "required": ["tool_name"],
                "additionalProperties": false
            }
        },
        {
            "name": "refresh_registry",
            "description": "Re-synchronize the gateway's tool registry with \
                every upstream server and report what changed.",
            "inputSchema": {"type": "object", "properties": {}, "additionalProperties": false}
        }
    ])
}

fn jsonrpc_result(id: &Value, result: Value) -> Response {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
}

fn jsonrpc_error(id: &Value, code: i64, message: &str) -> Response {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }))
    .into_response()
}

pub(crate) async fn post_mcp(
    Extension(state): Extension<Arc<McpState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let id = body.get("id").cloned().unwrap_or(Value::Null);

    let Ok(message) = serde_json::from_value::<ClientJsonRpcMessage>(body.clone()) else {
        // Syntactically JSON-RPC but not a method we model.
        if body.get("method").is_some() {
            if id.is_null() {
                return StatusCode::ACCEPTED.into_response();
            }
            return jsonrpc_error(&id, -32601, "method not found");
        }
        return (StatusCode::BAD_REQUEST, "invalid MCP message").into_response();
    };

    match message {
        ClientJsonRpcMessage::Request(JsonRpcRequest { request, .. }) => {
            handle_request(&state, &headers, &id, request).await
        }
        ClientJsonRpcMessage::Notification(_) => StatusCode::ACCEPTED.into_response(),
        _ => (StatusCode::BAD_REQUEST, "unsupported MCP message").into_response(),
    }
}

async fn handle_request(
    state: &Arc<McpState>,
    headers: &HeaderMap,
    id: &Value,
    request: ClientRequest,
) -> Response {
    // Reject requests that reference a session we no longer know about.
    if !matches!(request, ClientRequest::InitializeRequest(_))
        && let Some(sid) = headers.get(HEADER_SESSION_ID).and_then(|v| v.to_str().ok())
        && !state.sessions.contains(sid)
    {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    }

    match request {
        ClientRequest::InitializeRequest(_) => {
            let session_id = state.sessions.create();
            let result = json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {
                    "name": state.server_name,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "instructions": state.instructions.current(),
            });
            let mut response = jsonrpc_result(id, result);
            let name = axum::http::HeaderName::from_bytes(HEADER_SESSION_ID.as_bytes());
            if let (Ok(name), Ok(value)) = (name, session_id.parse()) {
                response.headers_mut().insert(name, value);
            }
            response
        }
        ClientRequest::PingRequest(_) => jsonrpc_result(id, json!({})),
        ClientRequest::ListToolsRequest(_) => {
            jsonrpc_result(id, json!({"tools": meta_tool_definitions()}))
        }
        ClientRequest::CallToolRequest(req) => {
            let tool = req.params.name.to_string();
            let arguments = req.params.arguments.clone();

            let dispatch = meta_tools::dispatch(state, headers, &tool, arguments);
            let (body, is_error) = match std::panic::AssertUnwindSafe(dispatch)
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(tool = %tool, "meta-tool dispatch panicked");
                    let code = if tool == "refresh_registry" {
                        ErrorCode::RefreshError
                    } else {
                        ErrorCode::ExecutionError
                    };
                    (error_body(code.as_str(), "internal error", None), true)
                }
            };

            let text = serde_json::to_string(&body)
                .unwrap_or_else(|_| r#"{"error":"internal error","code":"execution_error"}"#.into());
            jsonrpc_result(
                id,
                json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": is_error,
                }),
            )
        }
        _ => jsonrpc_error(id, -32601, "method not found"),
    }
}

pub(crate) async fn get_mcp(
    Extension(state): Extension<Arc<McpState>>,
    headers: HeaderMap,
) -> Response {
    let Some(sid) = headers.get(HEADER_SESSION_ID).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing session id").into_response();
    };
    let Some(rx) = state.sessions.take_receiver(sid) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let message = rx.recv().await?;
        let frame = Bytes::from(format!("data: {message}\n\n"));
        Some((Ok::<_, std::convert::Infallible>(frame), rx))
    });

    Response::builder()
        .header(CONTENT_TYPE, EVENT_STREAM_MIME_TYPE)
        .header("cache-control", "no-store")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub(crate) async fn delete_mcp(
    Extension(state): Extension<Arc<McpState>>,
    headers: HeaderMap,
) -> Response {
    let Some(sid) = headers.get(HEADER_SESSION_ID).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing session id").into_response();
    };
    if state.sessions.remove(sid) {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::NOT_FOUND, "session not found").into_response()
    }
}
