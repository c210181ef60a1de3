mod common;

use async_trait::async_trait;
use common::{gateway_config, start_gateway, upstream};
use fastmcp_gateway::hooks::{
    ExecutionContext, ExecutionDecision, GatewayHook, ListToolsContext,
};
use fastmcp_gateway::registry::ToolEntry;
use fastmcp_test_support::{McpTestSession, MockUpstream, tool};
use serde_json::{Value, json};
use std::sync::Arc;

struct UserTokenHook;

#[async_trait]
impl GatewayHook for UserTokenHook {
    async fn before_execute(&self, ctx: &mut ExecutionContext) -> ExecutionDecision {
        ctx.extra_headers
            .insert("x-user-token".to_string(), "ut".to_string());
        ExecutionDecision::Continue
    }
}

struct DenyHook;

#[async_trait]
impl GatewayHook for DenyHook {
    async fn before_execute(&self, _ctx: &mut ExecutionContext) -> ExecutionDecision {
        ExecutionDecision::Deny {
            code: "forbidden".to_string(),
            message: "no permission".to_string(),
        }
    }
}

struct WrapResultHook;

#[async_trait]
impl GatewayHook for WrapResultHook {
    async fn after_execute(
        &self,
        _ctx: &mut ExecutionContext,
        result: Value,
        _is_error: bool,
    ) -> Value {
        json!({"wrapped": result})
    }
}

struct HideDomainHook(&'static str);

#[async_trait]
impl GatewayHook for HideDomainHook {
    async fn after_list_tools(
        &self,
        _ctx: &ListToolsContext,
        tools: Vec<Arc<ToolEntry>>,
    ) -> Vec<Arc<ToolEntry>> {
        tools.into_iter().filter(|t| t.domain != self.0).collect()
    }
}

#[tokio::test]
async fn execute_forwards_headers_and_uses_the_original_name() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);
    let hubspot = MockUpstream::start().await?;
    hubspot.set_tools(vec![tool("people_search", "Find people in hubspot")]);

    let mut config = gateway_config(vec![
        upstream("apollo", &apollo.url()),
        upstream("hubspot", &hubspot.url()),
    ]);
    config.upstreams[0]
        .static_headers
        .insert("X-Api-Key".to_string(), "k".to_string());

    let gateway = start_gateway(config, vec![Arc::new(UserTokenHook)]).await?;
    let session = McpTestSession::connect_with_headers(
        &gateway.base_url(),
        vec![("authorization".to_string(), "Bearer u1".to_string())],
    )
    .await?;

    let (body, is_error) = session
        .call_meta(
            "execute_tool",
            json!({"tool_name": "apollo_people_search", "arguments": {"name": "Jane"}}),
        )
        .await?;
    assert!(!is_error, "unexpected error: {body}");
    assert_eq!(body["tool"], "apollo_people_search");
    assert_eq!(body["result"]["content"][0]["text"], "ok");

    let calls = apollo.captured_calls();
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    // The upstream sees the unprefixed wire name.
    assert_eq!(call.name, "people_search");
    assert_eq!(call.arguments, json!({"name": "Jane"}));
    assert_eq!(call.headers.get("authorization").map(String::as_str), Some("Bearer u1"));
    assert_eq!(call.headers.get("x-api-key").map(String::as_str), Some("k"));
    assert_eq!(call.headers.get("x-user-token").map(String::as_str), Some("ut"));
    assert!(hubspot.captured_calls().is_empty());

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn denied_execution_short_circuits_before_the_upstream() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);

    let gateway = start_gateway(
        gateway_config(vec![upstream("apollo", &apollo.url())]),
        vec![Arc::new(DenyHook)],
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, is_error) = session
        .call_meta("execute_tool", json!({"tool_name": "people_search"}))
        .await?;
    assert!(is_error);
    assert_eq!(body, json!({"error": "no permission", "code": "forbidden"}));
    assert!(apollo.captured_calls().is_empty());

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn upstream_is_error_result_becomes_execution_error() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);
    apollo.set_error("people_search", "upstream exploded");

    let gateway = start_gateway(
        gateway_config(vec![upstream("apollo", &apollo.url())]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, is_error) = session
        .call_meta("execute_tool", json!({"tool_name": "people_search"}))
        .await?;
    assert!(is_error);
    assert_eq!(body["tool"], "people_search");
    assert_eq!(body["error"], "upstream exploded");
    assert_eq!(body["code"], "execution_error");

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_upstream_surfaces_upstream_error() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);

    let gateway = start_gateway(
        gateway_config(vec![upstream("apollo", &apollo.url())]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    apollo.stop();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let (body, is_error) = session
        .call_meta("execute_tool", json!({"tool_name": "people_search"}))
        .await?;
    assert!(is_error);
    assert_eq!(body["code"], "upstream_error");

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_tool_gets_fuzzy_suggestions() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);

    let gateway = start_gateway(
        gateway_config(vec![upstream("apollo", &apollo.url())]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, is_error) = session
        .call_meta("execute_tool", json!({"tool_name": "peoples_search"}))
        .await?;
    assert!(is_error);
    assert_eq!(body["code"], "tool_not_found");
    assert_eq!(body["details"]["suggestions"][0], "people_search");
    assert!(apollo.captured_calls().is_empty());

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn null_arguments_equal_an_empty_object() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);

    let gateway = start_gateway(
        gateway_config(vec![upstream("apollo", &apollo.url())]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, is_error) = session
        .call_meta(
            "execute_tool",
            json!({"tool_name": "people_search", "arguments": null}),
        )
        .await?;
    assert!(!is_error, "unexpected error: {body}");

    let calls = apollo.captured_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments, json!({}));

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn after_execute_hooks_can_transform_the_result() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);

    let gateway = start_gateway(
        gateway_config(vec![upstream("apollo", &apollo.url())]),
        vec![Arc::new(WrapResultHook)],
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, is_error) = session
        .call_meta("execute_tool", json!({"tool_name": "people_search"}))
        .await?;
    assert!(!is_error);
    assert_eq!(body["result"]["wrapped"]["content"][0]["text"], "ok");

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn hidden_tools_do_not_leak_through_schema_or_discovery() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);
    let hubspot = MockUpstream::start().await?;
    hubspot.set_tools(vec![tool("contacts_search", "Find contacts")]);

    let gateway = start_gateway(
        gateway_config(vec![
            upstream("apollo", &apollo.url()),
            upstream("hubspot", &hubspot.url()),
        ]),
        vec![Arc::new(HideDomainHook("apollo"))],
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    // The hidden tool's schema is unavailable and it is not suggested.
    let (body, is_error) = session
        .call_meta("get_tool_schema", json!({"tool_name": "people_search"}))
        .await?;
    assert!(is_error);
    assert_eq!(body["code"], "tool_not_found");
    if let Some(suggestions) = body["details"].get("suggestions") {
        for s in suggestions.as_array().expect("suggestions") {
            assert_ne!(s, "people_search");
        }
    }

    // Domain summaries are rebuilt from the filtered set.
    let (body, _) = session.call_meta("discover_tools", json!({})).await?;
    assert_eq!(body["total_tools"], 1);
    assert_eq!(body["domains"][0]["name"], "apollo");
    assert_eq!(body["domains"][0]["tool_count"], 0);
    assert_eq!(body["domains"][1]["tool_count"], 1);

    gateway.shutdown().await;
    Ok(())
}
