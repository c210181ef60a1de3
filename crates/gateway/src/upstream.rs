//! Upstream connection management.
//!
//! Each registered domain owns one persistent discovery connection used for
//! `tools/list` during populate and refresh. Executions open a fresh one-shot
//! connection carrying the merged per-request headers, so user context never
//! leaks into the discovery path or across calls.

use crate::error::{GatewayError, Result};
use crate::registry::{RegistryDiff, ToolRegistry, ToolSpec};
use crate::streamable_http::{McpHttpClient, TransportError};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header::AUTHORIZATION};
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Transport-level timeout applied to every upstream request.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers never forwarded to upstreams: hop-by-hop per RFC 9110 plus
/// length/transport headers the execution client sets itself.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "content-type",
    "accept",
    "accept-encoding",
    "mcp-session-id",
    "last-event-id",
];

/// Static registration data for one upstream.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub domain: String,
    pub url: String,
    pub description: Option<String>,
    pub static_headers: HashMap<String, String>,
}

/// Result of `refresh_all`: per-domain diffs plus the domains that failed.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub diffs: Vec<RegistryDiff>,
    pub failed: Vec<String>,
}

impl RefreshReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.diffs.iter().any(|d| !d.is_empty())
    }
}

/// Raw upstream call result plus its error flag.
#[derive(Debug)]
pub struct ExecuteOutcome {
    pub result: Value,
    pub is_error: bool,
}

struct UpstreamHandle {
    config: UpstreamConfig,
    discovery: DiscoveryClient,
}

/// Persistent `tools/list` connection for one domain.
///
/// The session is established lazily and dropped on any failure, so the next
/// populate or refresh performs a fresh handshake.
struct DiscoveryClient {
    client: McpHttpClient,
    session: tokio::sync::Mutex<Option<DiscoverySession>>,
}

struct DiscoverySession {
    /// `None` for stateless upstreams that issue no session id.
    id: Option<String>,
}

impl DiscoveryClient {
    fn new(client: McpHttpClient) -> Self {
        Self {
            client,
            session: tokio::sync::Mutex::new(None),
        }
    }

    async fn list_tools(&self, client_name: &str) -> std::result::Result<Vec<ToolSpec>, TransportError> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            let id = self.client.initialize(client_name).await?;
            *session = Some(DiscoverySession { id });
        }
        let session_id = session.as_ref().and_then(|s| s.id.clone());

        let message = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}});
        let result = self.client.request(&message, session_id.as_deref()).await;
        match result {
            Ok(value) => {
                let tools = value
                    .get("tools")
                    .cloned()
                    .ok_or_else(|| {
                        TransportError::Protocol("tools/list result without tools".to_string())
                    })?;
                Ok(serde_json::from_value(tools)?)
            }
            Err(e) => {
                // Force a new handshake on the next attempt.
                *session = None;
                Err(e)
            }
        }
    }
}

/// Owns every upstream connection and feeds the registry.
pub struct UpstreamManager {
    http: reqwest::Client,
    registry: Arc<ToolRegistry>,
    client_name: String,
    discovery_auth_token: Option<String>,
    upstreams: RwLock<HashMap<String, Arc<UpstreamHandle>>>,
}

impl UpstreamManager {
    /// # Errors
    ///
    /// Returns a configuration error if the shared HTTP client cannot be built.
    pub fn new(
        registry: Arc<ToolRegistry>,
        client_name: impl Into<String>,
        discovery_auth_token: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            registry,
            client_name: client_name.into(),
            discovery_auth_token,
            upstreams: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Register (or replace) an upstream without contacting it.
    ///
    /// Re-registration rebuilds the handle from scratch, so headers omitted on
    /// the second call are gone, not silently preserved.
    pub fn register(&self, config: UpstreamConfig) {
        let headers = self.discovery_headers(&config.static_headers);
        let client = McpHttpClient::new(self.http.clone(), config.url.clone(), headers);
        let handle = Arc::new(UpstreamHandle {
            config: config.clone(),
            discovery: DiscoveryClient::new(client),
        });
        self.upstreams.write().insert(config.domain.clone(), handle);
    }

    /// Idempotent upsert plus an immediate populate of the new domain.
    ///
    /// A discovery failure is logged and reported as an empty diff; the
    /// upstream stays registered so the next refresh retries it.
    pub async fn add_upstream(&self, config: UpstreamConfig) -> RegistryDiff {
        let domain = config.domain.clone();
        self.register(config);
        match self.refresh_domain(&domain).await {
            Ok(diff) => diff,
            Err(e) => {
                tracing::warn!(domain = %domain, error = %e, "initial population failed; will retry on refresh");
                RegistryDiff {
                    domain,
                    added: Vec::new(),
                    removed: Vec::new(),
                    tool_count: 0,
                }
            }
        }
    }

    /// Drop the upstream, its discovery connection, and its registry slice.
    pub fn remove_upstream(&self, domain: &str) -> bool {
        let removed = self.upstreams.write().remove(domain).is_some();
        if removed {
            self.registry.remove_domain(domain);
        }
        removed
    }

    #[must_use]
    pub fn list_upstreams(&self) -> BTreeMap<String, String> {
        self.upstreams
            .read()
            .iter()
            .map(|(domain, handle)| (domain.clone(), handle.config.url.clone()))
            .collect()
    }

    /// Initial fan-out across every registered domain. Failures are logged
    /// and skipped; only successful diffs are returned.
    pub async fn populate_all(&self) -> Vec<RegistryDiff> {
        self.refresh_all().await.diffs
    }

    /// Refresh every domain, keeping the previous snapshot wherever the
    /// upstream is unreachable.
    pub async fn refresh_all(&self) -> RefreshReport {
        let domains: Vec<String> = {
            let mut names: Vec<String> = self.upstreams.read().keys().cloned().collect();
            names.sort();
            names
        };

        let results = futures::future::join_all(
            domains.iter().map(|d| self.refresh_domain_logged(d.clone())),
        )
        .await;

        let mut report = RefreshReport::default();
        for (domain, result) in domains.into_iter().zip(results) {
            match result {
                Ok(diff) => report.diffs.push(diff),
                Err(_) => report.failed.push(domain),
            }
        }
        report
    }

    async fn refresh_domain_logged(&self, domain: String) -> Result<RegistryDiff> {
        let result = self.refresh_domain(&domain).await;
        if let Err(e) = &result {
            tracing::warn!(domain = %domain, error = %e, "refresh failed; keeping previous snapshot");
        }
        result
    }

    /// Re-list one domain's tools and swap its registry slice.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown domain or a discovery failure. The
    /// registry is untouched on error.
    pub async fn refresh_domain(&self, domain: &str) -> Result<RegistryDiff> {
        let handle = self
            .upstreams
            .read()
            .get(domain)
            .cloned()
            .ok_or_else(|| GatewayError::DomainNotFound(domain.to_string()))?;

        let tools = handle
            .discovery
            .list_tools(&self.client_name)
            .await
            .map_err(|e| GatewayError::Upstream {
                domain: domain.to_string(),
                message: e.to_string(),
            })?;

        let diff =
            self.registry
                .populate_domain(domain, tools, handle.config.description.clone());
        tracing::debug!(
            domain = %domain,
            added = diff.added.len(),
            removed = diff.removed.len(),
            tool_count = diff.tool_count,
            "domain populated"
        );
        Ok(diff)
    }

    /// Execute one tool call on a fresh execution connection.
    ///
    /// The upstream sees `tool.original_name` and the merged header set
    /// (`extra_headers` over static domain headers over forwarded incoming
    /// headers). The connection's session is torn down on return; if the
    /// enclosing request is cancelled mid-call, a drop guard issues the
    /// teardown in the background.
    pub async fn execute(
        &self,
        tool: &crate::registry::ToolEntry,
        arguments: Map<String, Value>,
        incoming_headers: &HeaderMap,
        extra_headers: &HashMap<String, String>,
    ) -> Result<ExecuteOutcome> {
        let handle = self
            .upstreams
            .read()
            .get(&tool.domain)
            .cloned()
            .ok_or_else(|| GatewayError::DomainNotFound(tool.domain.clone()))?;

        let headers = merge_execution_headers(
            incoming_headers,
            &handle.config.static_headers,
            extra_headers,
        );
        let client =
            McpHttpClient::new(self.http.clone(), handle.config.url.clone(), headers);

        let upstream_err = |e: TransportError| GatewayError::Upstream {
            domain: tool.domain.clone(),
            message: e.to_string(),
        };

        let session_id = client.initialize(&self.client_name).await.map_err(upstream_err)?;
        let mut session = ExecutionSession::new(client.clone(), session_id);

        let mut params = json!({
            "name": tool.original_name,
            "arguments": Value::Object(arguments),
        });
        if let Some(meta) = trace_meta(incoming_headers)
            && let Some(obj) = params.as_object_mut()
        {
            obj.insert("_meta".to_string(), meta);
        }
        let message = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": params});

        let result = client
            .request(&message, session.session_id())
            .await
            .map_err(upstream_err);
        session.close().await;

        let result = result?;
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(ExecuteOutcome { result, is_error })
    }

    /// Consistent `(domain, url, tool_count)` snapshot for the registration
    /// API: the upstream map and the registry are each read under one lock
    /// acquisition.
    #[must_use]
    pub fn servers_snapshot(&self) -> Vec<(String, String, usize)> {
        let upstreams = self.upstreams.read();
        let counts = self.registry.tool_counts();
        let mut out: Vec<(String, String, usize)> = upstreams
            .iter()
            .map(|(domain, handle)| {
                (
                    domain.clone(),
                    handle.config.url.clone(),
                    counts.get(domain).copied().unwrap_or(0),
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn discovery_headers(&self, static_headers: &HashMap<String, String>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.discovery_auth_token
            && let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}"))
        {
            headers.insert(AUTHORIZATION, v);
        }
        overlay_headers(&mut headers, static_headers);
        headers
    }
}

/// One-shot execution session with best-effort teardown on drop.
struct ExecutionSession {
    client: McpHttpClient,
    session_id: Option<String>,
    closed: bool,
}

impl ExecutionSession {
    fn new(client: McpHttpClient, session_id: Option<String>) -> Self {
        Self {
            client,
            session_id,
            closed: false,
        }
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn close(&mut self) {
        self.closed = true;
        if let Some(sid) = &self.session_id
            && let Err(e) = self.client.delete_session(sid).await
        {
            tracing::debug!(url = %self.client.url(), error = %e, "session delete failed");
        }
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(sid) = self.session_id.take() else {
            return;
        };
        let client = self.client.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = client.delete_session(&sid).await;
            });
        }
    }
}

/// Merge the outbound header set for one execution.
///
/// Priority (later wins): forwarded incoming headers, then static domain
/// headers, then hook-provided extras. Hop-by-hop and transport headers are
/// stripped from the incoming set first.
#[must_use]
pub fn merge_execution_headers(
    incoming: &HeaderMap,
    static_headers: &HashMap<String, String>,
    extra_headers: &HashMap<String, String>,
) -> HeaderMap {
    let mut merged = HeaderMap::new();
    for (name, value) in incoming {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        merged.append(name.clone(), value.clone());
    }
    overlay_headers(&mut merged, static_headers);
    overlay_headers(&mut merged, extra_headers);
    merged
}

fn overlay_headers(headers: &mut HeaderMap, source: &HashMap<String, String>) {
    for (name, value) in source {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(header = %name, "invalid header name; skipping");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            tracing::warn!(header = %name, "invalid header value; skipping");
            continue;
        };
        headers.insert(name, value);
    }
}

fn trace_meta(incoming: &HeaderMap) -> Option<Value> {
    let traceparent = incoming.get("traceparent")?.to_str().ok()?;
    let mut meta = json!({"traceparent": traceparent});
    if let Some(state) = incoming.get("tracestate").and_then(|v| v.to_str().ok())
        && let Some(obj) = meta.as_object_mut()
    {
        obj.insert("tracestate".to_string(), Value::String(state.to_string()));
    }
    Some(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn merge_strips_hop_by_hop_and_transport_headers() {
        let mut incoming = HeaderMap::new();
        incoming.insert("connection", "keep-alive".parse().expect("value"));
        incoming.insert("content-length", "42".parse().expect("value"));
        incoming.insert("mcp-session-id", "abc".parse().expect("value"));
        incoming.insert("x-request-id", "r1".parse().expect("value"));

        let merged = merge_execution_headers(&incoming, &HashMap::new(), &HashMap::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("x-request-id").and_then(|v| v.to_str().ok()), Some("r1"));
    }

    #[test]
    fn merge_priority_extra_over_static_over_incoming() {
        let mut incoming = HeaderMap::new();
        incoming.insert("x-tenant", "from-request".parse().expect("value"));
        incoming.insert("authorization", "Bearer u1".parse().expect("value"));

        let merged = merge_execution_headers(
            &incoming,
            &map(&[("x-tenant", "from-static"), ("x-api-key", "k")]),
            &map(&[("x-tenant", "from-hook"), ("x-user-token", "ut")]),
        );

        let get = |name: &str| merged.get(name).and_then(|v| v.to_str().ok());
        assert_eq!(get("x-tenant"), Some("from-hook"));
        assert_eq!(get("x-api-key"), Some("k"));
        assert_eq!(get("x-user-token"), Some("ut"));
        assert_eq!(get("authorization"), Some("Bearer u1"));
    }

    #[test]
    fn merge_skips_invalid_static_headers() {
        let merged = merge_execution_headers(
            &HeaderMap::new(),
            &map(&[("bad name", "v"), ("x-good", "ok")]),
            &HashMap::new(),
        );
        assert_eq!(merged.len(), 1);
        assert!(merged.get("x-good").is_some());
    }

    #[test]
    fn trace_meta_carries_traceparent() {
        let mut incoming = HeaderMap::new();
        incoming.insert(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
                .parse()
                .expect("value"),
        );
        let meta = trace_meta(&incoming).expect("meta");
        assert!(meta["traceparent"].as_str().expect("str").starts_with("00-"));
        assert!(meta.get("tracestate").is_none());
    }
}
