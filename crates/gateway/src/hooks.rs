//! Lifecycle hook pipeline.
//!
//! Hooks are user-supplied trait objects invoked around authentication, tool
//! listing, and tool execution. Every method has a no-op default, so a hook
//! implements only the phases it cares about. The runner holds no gateway
//! lock while a hook executes; hooks own their own synchronization.

use crate::error::GatewayError;
use crate::registry::ToolEntry;
use async_trait::async_trait;
use axum::http::HeaderMap;
use futures::FutureExt as _;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Per-execution state threaded through the hook pipeline.
pub struct ExecutionContext {
    /// The resolved tool being executed.
    pub tool: Arc<ToolEntry>,
    /// Call arguments; `before_execute` hooks may rewrite them.
    pub arguments: Map<String, Value>,
    /// Incoming HTTP headers (read-only).
    pub headers: HeaderMap,
    /// Identity established by `on_authenticate`, if any.
    pub user: Option<Value>,
    /// Headers hooks want attached to the upstream call.
    pub extra_headers: HashMap<String, String>,
    /// Free-form hook-to-hook signalling.
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(
        tool: Arc<ToolEntry>,
        arguments: Map<String, Value>,
        headers: HeaderMap,
        user: Option<Value>,
    ) -> Self {
        Self {
            tool,
            arguments,
            headers,
            user,
            extra_headers: HashMap::new(),
            metadata: Map::new(),
        }
    }
}

/// Context for tool-list filtering.
pub struct ListToolsContext {
    /// Domain being listed, or `None` for a cross-domain view.
    pub domain: Option<String>,
    pub headers: HeaderMap,
    pub user: Option<Value>,
}

/// Verdict from a `before_execute` hook.
pub enum ExecutionDecision {
    Continue,
    /// Refuse the call with a stable error code and a human message.
    Deny { code: String, message: String },
}

impl ExecutionDecision {
    /// Deny with the default `forbidden` code.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Deny {
            code: "forbidden".to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Debug for dyn GatewayHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHook").finish()
    }
}

/// A user-supplied lifecycle hook. All methods default to no-ops.
#[async_trait]
pub trait GatewayHook: Send + Sync {
    /// Establish an identity from the incoming headers. Across hooks the last
    /// non-null result wins.
    async fn on_authenticate(&self, _headers: &HeaderMap) -> Option<Value> {
        None
    }

    /// Filter or reorder the tool list a client is about to see. Hooks run as
    /// a pipeline; each receives the previous hook's output.
    async fn after_list_tools(
        &self,
        _ctx: &ListToolsContext,
        tools: Vec<Arc<ToolEntry>>,
    ) -> Vec<Arc<ToolEntry>> {
        tools
    }

    /// Inspect or rewrite an execution before it reaches the upstream.
    async fn before_execute(&self, _ctx: &mut ExecutionContext) -> ExecutionDecision {
        ExecutionDecision::Continue
    }

    /// Transform the upstream result. Hooks run as a pipeline.
    async fn after_execute(
        &self,
        _ctx: &mut ExecutionContext,
        result: Value,
        _is_error: bool,
    ) -> Value {
        result
    }

    /// Observe a failure. Must not fail itself; panics are swallowed.
    async fn on_error(&self, _ctx: &ExecutionContext, _error: &GatewayError) {}
}

/// Ordered hook pipeline.
#[derive(Default)]
pub struct HookRunner {
    hooks: Vec<Arc<dyn GatewayHook>>,
}

impl HookRunner {
    #[must_use]
    pub fn new(hooks: Vec<Arc<dyn GatewayHook>>) -> Self {
        Self { hooks }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Option<Value> {
        let mut user = None;
        for hook in &self.hooks {
            if let Some(identity) = hook.on_authenticate(headers).await {
                user = Some(identity);
            }
        }
        user
    }

    pub async fn after_list_tools(
        &self,
        ctx: &ListToolsContext,
        tools: Vec<Arc<ToolEntry>>,
    ) -> Vec<Arc<ToolEntry>> {
        let mut tools = tools;
        for hook in &self.hooks {
            tools = hook.after_list_tools(ctx, tools).await;
        }
        tools
    }

    /// Run `before_execute` hooks in order; the first denial short-circuits.
    pub async fn before_execute(&self, ctx: &mut ExecutionContext) -> ExecutionDecision {
        for hook in &self.hooks {
            if let ExecutionDecision::Deny { code, message } = hook.before_execute(ctx).await {
                return ExecutionDecision::Deny { code, message };
            }
        }
        ExecutionDecision::Continue
    }

    pub async fn after_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: Value,
        is_error: bool,
    ) -> Value {
        let mut result = result;
        for hook in &self.hooks {
            result = hook.after_execute(ctx, result, is_error).await;
        }
        result
    }

    /// Notify hooks of a failure. A hook that panics here is logged and
    /// ignored; `on_error` never propagates.
    pub async fn on_error(&self, ctx: &ExecutionContext, error: &GatewayError) {
        for hook in &self.hooks {
            let call = std::panic::AssertUnwindSafe(hook.on_error(ctx, error));
            if call.catch_unwind().await.is_err() {
                tracing::error!(tool = %ctx.tool.name, "on_error hook panicked; ignoring");
            }
        }
    }
}

/// Authenticates from a single header, exposing `{"id": <value>}`.
///
/// Registered under the factory name `header_identity`; the default header is
/// `x-user-id`.
pub struct HeaderIdentityHook {
    header: String,
}

impl HeaderIdentityHook {
    #[must_use]
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

#[async_trait]
impl GatewayHook for HeaderIdentityHook {
    async fn on_authenticate(&self, headers: &HeaderMap) -> Option<Value> {
        let value = headers.get(&self.header)?.to_str().ok()?;
        if value.is_empty() {
            return None;
        }
        Some(serde_json::json!({"id": value, "header": self.header}))
    }
}

type HookFactory = fn() -> Vec<Arc<dyn GatewayHook>>;

fn factories() -> &'static parking_lot::RwLock<HashMap<String, HookFactory>> {
    static FACTORIES: OnceLock<parking_lot::RwLock<HashMap<String, HookFactory>>> =
        OnceLock::new();
    FACTORIES.get_or_init(|| parking_lot::RwLock::new(HashMap::new()))
}

/// Register a named hook set for `GATEWAY_HOOK_MODULE` lookup.
pub fn register_hook_factory(name: &str, factory: HookFactory) {
    factories().write().insert(name.to_string(), factory);
}

/// Resolve a configured hook-set name to hook instances.
///
/// # Errors
///
/// Returns a configuration error for an unknown name.
pub fn resolve_hooks(name: Option<&str>) -> crate::error::Result<Vec<Arc<dyn GatewayHook>>> {
    let Some(name) = name else {
        return Ok(Vec::new());
    };
    match name {
        "header_identity" => Ok(vec![Arc::new(HeaderIdentityHook::new("x-user-id"))]),
        other => {
            if let Some(factory) = factories().read().get(other) {
                return Ok(factory());
            }
            Err(GatewayError::Config(format!(
                "unknown hook set '{other}' (is it registered with register_hook_factory?)"
            )))
        }
    }
}
