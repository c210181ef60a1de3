//! Integration-test helpers for the fastmcp gateway.
//!
//! Provides an in-process mock upstream MCP server (scriptable tool lists,
//! call results, header capture) and a minimal streamable-HTTP MCP client for
//! driving the gateway itself. This crate intentionally re-implements no
//! production MCP logic; it exists only for tests.

use axum::{
    Extension, Json, Router,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pick an unused TCP port on localhost.
///
/// Note: this does not reserve the port; it's still possible for another
/// process to bind it before you do.
///
/// # Errors
///
/// Returns an error if binding an ephemeral localhost port fails.
pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Poll an HTTP URL until it returns a success status.
///
/// # Errors
///
/// Returns an error if the timeout elapses first.
pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}

/// A `tools/call` observed by a mock upstream.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub name: String,
    pub arguments: Value,
    pub headers: HashMap<String, String>,
    pub meta: Option<Value>,
}

#[derive(Default)]
struct MockState {
    tools: RwLock<Vec<Value>>,
    results: RwLock<HashMap<String, Value>>,
    calls: Mutex<Vec<CapturedCall>>,
    fail_listing: AtomicBool,
    list_count: AtomicUsize,
    initialize_count: AtomicUsize,
    deleted_sessions: AtomicUsize,
}

/// In-process upstream MCP server over streamable HTTP (JSON responses).
pub struct MockUpstream {
    addr: std::net::SocketAddr,
    state: Arc<MockState>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    /// Start serving on an ephemeral localhost port.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route(
                "/mcp",
                axum::routing::post(handle_post).delete(handle_delete),
            )
            .layer(Extension(Arc::clone(&state)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });

        Ok(Self {
            addr,
            state,
            cancel,
            task,
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.state.tools.write() = tools;
    }

    /// Script the `tools/call` result for one tool (keyed by wire name).
    pub fn set_result(&self, tool: &str, result: Value) {
        self.state.results.write().insert(tool.to_string(), result);
    }

    /// Script an `isError` result carrying the given text.
    pub fn set_error(&self, tool: &str, message: &str) {
        self.set_result(
            tool,
            json!({"content": [{"type": "text", "text": message}], "isError": true}),
        );
    }

    /// Make `tools/list` answer HTTP 500 until re-enabled.
    pub fn fail_tools_list(&self, fail: bool) {
        self.state.fail_listing.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn captured_calls(&self) -> Vec<CapturedCall> {
        self.state.calls.lock().clone()
    }

    #[must_use]
    pub fn list_count(&self) -> usize {
        self.state.list_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn initialize_count(&self) -> usize {
        self.state.initialize_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deleted_sessions(&self) -> usize {
        self.state.deleted_sessions.load(Ordering::SeqCst)
    }

    /// Stop serving. The listener task also stops when the mock is dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Build a minimal tool definition.
#[must_use]
pub fn tool(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": {}},
    })
}

/// Build a tool definition carrying a `_meta.group` tag.
#[must_use]
pub fn grouped_tool(name: &str, description: &str, group: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": {}},
        "_meta": {"group": group},
    })
}

async fn handle_post(
    Extension(state): Extension<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();

    match method {
        "initialize" => {
            state.initialize_count.fetch_add(1, Ordering::SeqCst);
            let result = json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "mock-upstream", "version": "0"},
            });
            let mut response =
                Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response();
            let session = uuid::Uuid::new_v4().to_string();
            if let Ok(v) = session.parse() {
                response.headers_mut().insert("mcp-session-id", v);
            }
            response
        }
        "tools/list" => {
            state.list_count.fetch_add(1, Ordering::SeqCst);
            if state.fail_listing.load(Ordering::SeqCst) {
                return (StatusCode::INTERNAL_SERVER_ERROR, "listing disabled").into_response();
            }
            let tools = state.tools.read().clone();
            Json(json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools}})).into_response()
        }
        "tools/call" => {
            let params = body.get("params").cloned().unwrap_or_default();
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let captured = CapturedCall {
                name: name.clone(),
                arguments: params.get("arguments").cloned().unwrap_or(Value::Null),
                headers: headers
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.as_str().to_string(),
                            v.to_str().unwrap_or_default().to_string(),
                        )
                    })
                    .collect(),
                meta: params.get("_meta").cloned(),
            };
            state.calls.lock().push(captured);

            let result = state.results.read().get(&name).cloned().unwrap_or_else(|| {
                json!({"content": [{"type": "text", "text": "ok"}], "isError": false})
            });
            Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
        }
        _ if id.is_null() => StatusCode::ACCEPTED.into_response(),
        other => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("method not found: {other}")},
        }))
        .into_response(),
    }
}

async fn handle_delete(Extension(state): Extension<Arc<MockState>>) -> StatusCode {
    state.deleted_sessions.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

/// Minimal MCP client for the gateway's streamable HTTP endpoint.
pub struct McpTestSession {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
    default_headers: Vec<(String, String)>,
}

impl McpTestSession {
    /// Perform the MCP handshake against `{base_url}/mcp`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or a malformed handshake.
    pub async fn connect(base_url: &str) -> anyhow::Result<Self> {
        Self::connect_with_headers(base_url, Vec::new()).await
    }

    /// Handshake with extra headers attached to every request (e.g. an
    /// `Authorization` header the gateway should forward).
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or a malformed handshake.
    pub async fn connect_with_headers(
        base_url: &str,
        default_headers: Vec<(String, String)>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::new();
        let base_url = base_url.trim_end_matches('/').to_string();

        let init = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "fastmcp-gateway-tests", "version": "0"},
            },
        });
        let resp = post_mcp(&client, &base_url, None, &default_headers, &init).await?;
        let session_id = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| anyhow::anyhow!("missing Mcp-Session-Id header"))?
            .to_string();
        let message: Value = resp.json().await?;
        anyhow::ensure!(message.get("result").is_some(), "initialize failed: {message}");

        let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let resp = post_mcp(
            &client,
            &base_url,
            Some(&session_id),
            &default_headers,
            &initialized,
        )
        .await?;
        anyhow::ensure!(
            resp.status() == StatusCode::ACCEPTED,
            "notifications/initialized returned {}",
            resp.status()
        );

        Ok(Self {
            client,
            base_url,
            session_id,
            default_headers,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send one JSON-RPC request and return the raw response message.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures.
    pub async fn request(&self, id: u64, method: &str, params: Value) -> anyhow::Result<Value> {
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let resp = post_mcp(
            &self.client,
            &self.base_url,
            Some(&self.session_id),
            &self.default_headers,
            &body,
        )
        .await?;
        Ok(resp.json().await?)
    }

    /// Call a meta-tool and decode its JSON payload from the text content.
    ///
    /// Returns `(payload, is_error)`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or an unexpected result shape.
    pub async fn call_meta(&self, tool: &str, args: Value) -> anyhow::Result<(Value, bool)> {
        let message = self
            .request(1, "tools/call", json!({"name": tool, "arguments": args}))
            .await?;
        let result = message
            .get("result")
            .ok_or_else(|| anyhow::anyhow!("tools/call failed: {message}"))?;
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing text content: {message}"))?;
        Ok((serde_json::from_str(text)?, is_error))
    }

    /// Open the standalone SSE stream and wait for the first notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout elapses or the stream ends first.
    pub async fn wait_for_notification(&self, timeout_dur: Duration) -> anyhow::Result<Value> {
        let fut = async {
            let mut resp = self
                .client
                .get(format!("{}/mcp", self.base_url))
                .header("Accept", "text/event-stream")
                .header("Mcp-Session-Id", &self.session_id)
                .send()
                .await?
                .error_for_status()?;

            let mut buffer = String::new();
            while let Some(chunk) = resp.chunk().await? {
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                // Only parse once a full SSE event (terminated by a blank
                // line) has arrived.
                if let Some(event_end) = buffer.find("\n\n") {
                    for line in buffer[..event_end].lines() {
                        if let Some(data) = line.strip_prefix("data:") {
                            return Ok(serde_json::from_str(data.trim())?);
                        }
                    }
                    buffer.drain(..event_end + 2);
                }
            }
            anyhow::bail!("event stream ended without a notification")
        };
        tokio::time::timeout(timeout_dur, fut)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for a notification"))?
    }

    /// Close the session on the server.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures.
    pub async fn close(self) -> anyhow::Result<()> {
        self.client
            .delete(format!("{}/mcp", self.base_url))
            .header("Mcp-Session-Id", &self.session_id)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

async fn post_mcp(
    client: &reqwest::Client,
    base_url: &str,
    session_id: Option<&str>,
    default_headers: &[(String, String)],
    body: &Value,
) -> anyhow::Result<reqwest::Response> {
    let mut req = client
        .post(format!("{base_url}/mcp"))
        .header("Accept", "application/json, text/event-stream")
        .json(body);
    if let Some(session_id) = session_id {
        req = req.header("Mcp-Session-Id", session_id);
    }
    for (name, value) in default_headers {
        req = req.header(name, value);
    }
    let resp = req.send().await?;
    anyhow::ensure!(
        !resp.status().is_server_error() && resp.status() != StatusCode::NOT_FOUND,
        "POST /mcp returned {}",
        resp.status()
    );
    Ok(resp)
}
