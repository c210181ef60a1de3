//! Gateway wiring: HTTP router, handshake instructions, health endpoints,
//! and the background refresh loop.

use crate::admin::{self, AdminState, MIN_TOKEN_LENGTH};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::hooks::{GatewayHook, HookRunner};
use crate::mcp::{self, McpState, SessionRegistry};
use crate::registry::{RegistryDiff, ToolRegistry};
use crate::upstream::UpstreamManager;
use axum::{
    Extension, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// MCP handshake instructions: a configured static string wins; otherwise the
/// text is rebuilt from the registry after every populate and refresh.
pub struct Instructions {
    custom: Option<String>,
    dynamic: RwLock<String>,
}

impl Instructions {
    #[must_use]
    pub fn new(custom: Option<String>) -> Self {
        Self {
            custom,
            dynamic: RwLock::new(String::new()),
        }
    }

    #[must_use]
    pub fn current(&self) -> String {
        if let Some(custom) = &self.custom {
            return custom.clone();
        }
        self.dynamic.read().clone()
    }

    pub fn rebuild(&self, registry: &ToolRegistry) {
        if self.custom.is_some() {
            return;
        }
        *self.dynamic.write() = build_instructions(registry);
    }
}

fn build_instructions(registry: &ToolRegistry) -> String {
    let mut text = String::from(
        "This gateway aggregates tools from multiple upstream MCP servers and \
         exposes them progressively. Start with discover_tools to browse the \
         available domains, fetch a tool's parameters with get_tool_schema, \
         and run it with execute_tool. refresh_registry re-synchronizes the \
         registry with the upstreams.\n\nAvailable domains:\n",
    );
    let domains = registry.list_domains();
    if domains.is_empty() {
        text.push_str("(none registered yet)\n");
        return text;
    }
    for info in domains {
        match info.description {
            Some(description) => {
                text.push_str(&format!(
                    "- {} ({} tools): {}\n",
                    info.name, info.tool_count, description
                ));
            }
            None => {
                text.push_str(&format!("- {} ({} tools)\n", info.name, info.tool_count));
            }
        }
    }
    text
}

/// Server lifecycle, gating `/readyz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    Populated,
    Running,
    Stopped,
}

/// The assembled gateway.
pub struct GatewayServer {
    config: GatewayConfig,
    registry: Arc<ToolRegistry>,
    manager: Arc<UpstreamManager>,
    hooks: Arc<HookRunner>,
    sessions: Arc<SessionRegistry>,
    instructions: Arc<Instructions>,
    lifecycle: RwLock<Lifecycle>,
}

impl GatewayServer {
    /// Wire the registry, upstream manager and hook runner from a validated
    /// configuration. No upstream is contacted yet; call [`Self::populate`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the shared HTTP client cannot be
    /// built.
    pub fn new(config: GatewayConfig, hooks: Vec<Arc<dyn GatewayHook>>) -> Result<Arc<Self>> {
        let registry = Arc::new(ToolRegistry::new());
        let manager = Arc::new(UpstreamManager::new(
            Arc::clone(&registry),
            config.name.clone(),
            config.registry_auth_token.clone(),
        )?);
        for upstream in &config.upstreams {
            manager.register(upstream.clone());
        }

        if let Some(token) = &config.registration_token
            && token.len() < MIN_TOKEN_LENGTH
        {
            tracing::warn!(
                "registration token is shorter than {MIN_TOKEN_LENGTH} characters; \
                 consider a longer one"
            );
        }

        let instructions = Arc::new(Instructions::new(config.instructions.clone()));
        instructions.rebuild(&registry);

        Ok(Arc::new(Self {
            config,
            registry,
            manager,
            hooks: Arc::new(HookRunner::new(hooks)),
            sessions: Arc::new(SessionRegistry::default()),
            instructions,
            lifecycle: RwLock::new(Lifecycle::Constructed),
        }))
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<UpstreamManager> {
        &self.manager
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    /// Initial registry population across every configured upstream.
    /// Per-domain failures are logged and leave that domain absent.
    pub async fn populate(&self) -> Vec<RegistryDiff> {
        let diffs = self.manager.populate_all().await;
        self.instructions.rebuild(&self.registry);
        let mut lifecycle = self.lifecycle.write();
        if *lifecycle == Lifecycle::Constructed {
            *lifecycle = Lifecycle::Populated;
        }
        diffs
    }

    /// Build the HTTP surface: `/mcp`, health endpoints, and (when a
    /// registration token is configured) the `/registry` API.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        let mcp_state = Arc::new(McpState {
            registry: Arc::clone(&self.registry),
            manager: Arc::clone(&self.manager),
            hooks: Arc::clone(&self.hooks),
            sessions: Arc::clone(&self.sessions),
            instructions: Arc::clone(&self.instructions),
            server_name: self.config.name.clone(),
        });

        let mut app = Router::new()
            .route(
                "/mcp",
                axum::routing::post(mcp::post_mcp)
                    .get(mcp::get_mcp)
                    .delete(mcp::delete_mcp),
            )
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz));

        if let Some(token) = &self.config.registration_token {
            let admin_state = Arc::new(AdminState {
                manager: Arc::clone(&self.manager),
                instructions: Arc::clone(&self.instructions),
                sessions: Arc::clone(&self.sessions),
                token: token.clone(),
            });
            app = app.merge(admin::router().layer(Extension(admin_state)));
        }

        app.layer(Extension(mcp_state))
            .layer(Extension(Arc::clone(self)))
    }

    /// Bind and serve. Also spawns the background refresh loop when a
    /// refresh interval is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn start(self: Arc<Self>, addr: &str) -> anyhow::Result<RunningGateway> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let refresh_cancel = CancellationToken::new();
        let refresh_task = self
            .config
            .refresh_interval
            .map(|interval| spawn_refresh_loop(Arc::clone(&self), interval, refresh_cancel.clone()));

        let serve_cancel = CancellationToken::new();
        let app = self.router();
        let shutdown = serve_cancel.clone();
        let serve_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        *self.lifecycle.write() = Lifecycle::Running;
        tracing::info!(addr = %local_addr, "gateway listening");

        Ok(RunningGateway {
            addr: local_addr,
            server: self,
            refresh_cancel,
            refresh_task,
            serve_cancel,
            serve_task,
        })
    }
}

/// The refresh loop sleeps, re-lists every upstream, rebuilds instructions,
/// and notifies connected sessions when the tool set changed. Cancellation is
/// cooperative: the per-domain registry swap is atomic, so stopping between
/// (or during) iterations can never leave a domain half-updated.
fn spawn_refresh_loop(
    server: Arc<GatewayServer>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "background refresh enabled");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    let report = server.manager.refresh_all().await;
                    server.instructions.rebuild(&server.registry);
                    if !report.failed.is_empty() {
                        tracing::warn!(failed = ?report.failed, "refresh completed with failures");
                    }
                    if report.changed() {
                        server.sessions.notify_tools_list_changed();
                    }
                }
            }
        }
        tracing::debug!("background refresh stopped");
    })
}

/// Handle to a serving gateway; dropping it does not stop the server, call
/// [`Self::shutdown`].
pub struct RunningGateway {
    addr: SocketAddr,
    server: Arc<GatewayServer>,
    refresh_cancel: CancellationToken,
    refresh_task: Option<JoinHandle<()>>,
    serve_cancel: CancellationToken,
    serve_task: JoinHandle<std::io::Result<()>>,
}

impl RunningGateway {
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn server(&self) -> &Arc<GatewayServer> {
        &self.server
    }

    /// Stop the refresh loop first (awaiting the in-flight iteration), then
    /// drain the HTTP server.
    pub async fn shutdown(self) {
        self.refresh_cancel.cancel();
        if let Some(task) = self.refresh_task {
            let _ = task.await;
        }
        self.serve_cancel.cancel();
        let _ = self.serve_task.await;
        *self.server.lifecycle.write() = Lifecycle::Stopped;
        tracing::info!("gateway stopped");
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(Extension(server): Extension<Arc<GatewayServer>>) -> Response {
    let populated = matches!(
        server.lifecycle(),
        Lifecycle::Populated | Lifecycle::Running
    ) && !server.registry.is_empty();
    if populated {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no populated domains").into_response()
    }
}
