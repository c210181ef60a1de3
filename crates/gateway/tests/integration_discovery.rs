mod common;

use common::{gateway_config, start_gateway, upstream};
use fastmcp_test_support::{McpTestSession, MockUpstream, grouped_tool, tool};
use serde_json::{Value, json};

#[tokio::test]
async fn cold_browse_returns_domain_summaries() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![
        tool("people_search", "Find people"),
        tool("org_search", "Find organizations"),
    ]);
    let hubspot = MockUpstream::start().await?;
    hubspot.set_tools(vec![tool("contacts_search", "Find contacts")]);

    let gateway = start_gateway(
        gateway_config(vec![
            upstream("apollo", &apollo.url()),
            upstream("hubspot", &hubspot.url()),
        ]),
        Vec::new(),
    )
    .await?;

    let session = McpTestSession::connect(&gateway.base_url()).await?;
    let (body, is_error) = session.call_meta("discover_tools", json!({})).await?;
    assert!(!is_error);
    assert_eq!(
        body,
        json!({
            "domains": [
                {"name": "apollo", "tool_count": 2, "groups": []},
                {"name": "hubspot", "tool_count": 1, "groups": []},
            ],
            "total_tools": 3,
        })
    );

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn domain_listing_group_filter_and_errors() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![
        grouped_tool("people_search", "Find people", "people"),
        grouped_tool("org_search", "Find organizations", "orgs"),
        tool("enrich", "Enrich a record"),
    ]);

    let gateway = start_gateway(
        gateway_config(vec![upstream("apollo", &apollo.url())]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, _) = session.call_meta("discover_tools", json!({})).await?;
    assert_eq!(body["domains"][0]["groups"], json!(["orgs", "people"]));

    let (body, is_error) = session
        .call_meta("discover_tools", json!({"domain": "apollo"}))
        .await?;
    assert!(!is_error);
    assert_eq!(body["domain"], "apollo");
    let tools = body["tools"].as_array().expect("tools array");
    assert_eq!(tools.len(), 3);
    assert_eq!(tools[0]["name"], "enrich");
    assert!(tools[0].get("group").is_none());
    assert_eq!(tools[2]["group"], "people");

    let (body, is_error) = session
        .call_meta("discover_tools", json!({"domain": "apollo", "group": "people"}))
        .await?;
    assert!(!is_error);
    assert_eq!(body["group"], "people");
    assert_eq!(body["tools"], json!([{"name": "people_search", "description": "Find people"}]));

    let (body, is_error) = session
        .call_meta("discover_tools", json!({"domain": "apollo", "group": "nope"}))
        .await?;
    assert!(is_error);
    assert_eq!(body["code"], "group_not_found");
    assert_eq!(body["details"]["valid_groups"], json!(["orgs", "people"]));

    let (body, is_error) = session
        .call_meta("discover_tools", json!({"group": "people"}))
        .await?;
    assert!(is_error);
    assert_eq!(body["code"], "group_not_found");

    let (body, is_error) = session
        .call_meta("discover_tools", json!({"domain": "salesforce"}))
        .await?;
    assert!(is_error);
    assert_eq!(body["code"], "domain_not_found");
    assert_eq!(body["details"]["valid_domains"], json!(["apollo"]));

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn query_searches_names_and_descriptions_across_domains() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![
        tool("people_search", "Find people"),
        tool("enrich", "Augment a record with search data"),
    ]);
    let hubspot = MockUpstream::start().await?;
    hubspot.set_tools(vec![tool("contacts_search", "Find contacts")]);

    let gateway = start_gateway(
        gateway_config(vec![
            upstream("apollo", &apollo.url()),
            upstream("hubspot", &hubspot.url()),
        ]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, is_error) = session
        .call_meta("discover_tools", json!({"query": "SEARCH"}))
        .await?;
    assert!(!is_error);
    assert_eq!(body["query"], "SEARCH");
    let names: Vec<&str> = body["results"]
        .as_array()
        .expect("results")
        .iter()
        .map(|r| r["name"].as_str().expect("name"))
        .collect();
    // "enrich" matches via its description; ordering is (domain, name).
    assert_eq!(names, vec!["enrich", "people_search", "contacts_search"]);
    assert_eq!(body["results"][0]["domain"], "apollo");

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn collision_prefixes_tools_and_suggests_both_sides() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("search", "Search apollo")]);
    let hubspot = MockUpstream::start().await?;
    hubspot.set_tools(vec![tool("search", "Search hubspot")]);

    let gateway = start_gateway(
        gateway_config(vec![
            upstream("apollo", &apollo.url()),
            upstream("hubspot", &hubspot.url()),
        ]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, _) = session
        .call_meta("discover_tools", json!({"domain": "apollo"}))
        .await?;
    assert_eq!(body["tools"][0]["name"], "apollo_search");

    let (body, is_error) = session
        .call_meta("get_tool_schema", json!({"tool_name": "search"}))
        .await?;
    assert!(is_error);
    assert_eq!(body["code"], "tool_not_found");
    assert_eq!(
        body["details"]["suggestions"],
        json!(["apollo_search", "hubspot_search"])
    );

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn fuzzy_resolution_returns_schema_for_close_typo() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);
    let hubspot = MockUpstream::start().await?;
    hubspot.set_tools(vec![tool("people_search", "Find people in hubspot")]);

    let gateway = start_gateway(
        gateway_config(vec![
            upstream("apollo", &apollo.url()),
            upstream("hubspot", &hubspot.url()),
        ]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, is_error) = session
        .call_meta("get_tool_schema", json!({"tool_name": "apollo_peple_search"}))
        .await?;
    assert!(!is_error, "expected fuzzy resolution, got {body}");
    assert_eq!(body["name"], "apollo_people_search");
    assert_eq!(body["domain"], "apollo");
    assert_eq!(body["parameters"]["type"], "object");
    assert!(body.get("suggestions").is_none());

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn schema_lookup_with_empty_name_is_not_found() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);

    let gateway = start_gateway(
        gateway_config(vec![upstream("apollo", &apollo.url())]),
        Vec::new(),
    )
    .await?;
    let session = McpTestSession::connect(&gateway.base_url()).await?;

    let (body, is_error) = session
        .call_meta("get_tool_schema", json!({"tool_name": ""}))
        .await?;
    assert!(is_error);
    assert_eq!(body["code"], "tool_not_found");

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn empty_registry_still_answers_discovery() -> anyhow::Result<()> {
    // Nothing listens on this port: population fails, the domain stays absent.
    let dead_port = fastmcp_test_support::pick_unused_port()?;
    let gateway = start_gateway(
        gateway_config(vec![upstream(
            "ghost",
            &format!("http://127.0.0.1:{dead_port}/mcp"),
        )]),
        Vec::new(),
    )
    .await?;

    let session = McpTestSession::connect(&gateway.base_url()).await?;
    let (body, is_error) = session.call_meta("discover_tools", json!({})).await?;
    assert!(!is_error);
    assert_eq!(body, json!({"domains": [], "total_tools": 0}));

    let client = reqwest::Client::new();
    let healthz = client
        .get(format!("{}/healthz", gateway.base_url()))
        .send()
        .await?;
    assert_eq!(healthz.status(), 200);
    let readyz = client
        .get(format!("{}/readyz", gateway.base_url()))
        .send()
        .await?;
    assert_eq!(readyz.status(), 503);

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn handshake_lists_meta_tools_and_builds_instructions() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![
        tool("people_search", "Find people"),
        tool("org_search", "Find organizations"),
    ]);

    let mut config = gateway_config(vec![upstream("apollo", &apollo.url())]);
    config.upstreams[0].description = Some("People and company data".to_string());
    let gateway = start_gateway(config, Vec::new()).await?;

    // Inspect the initialize result directly.
    let client = reqwest::Client::new();
    let init: Value = client
        .post(format!("{}/mcp", gateway.base_url()))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "probe", "version": "0"},
            },
        }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(init["result"]["capabilities"]["tools"]["listChanged"], true);
    let instructions = init["result"]["instructions"].as_str().expect("instructions");
    assert!(instructions.contains("- apollo (2 tools): People and company data"));

    let session = McpTestSession::connect(&gateway.base_url()).await?;
    let listed = session.request(2, "tools/list", json!({})).await?;
    let names: Vec<&str> = listed["result"]["tools"]
        .as_array()
        .expect("tools")
        .iter()
        .map(|t| t["name"].as_str().expect("name"))
        .collect();
    assert_eq!(
        names,
        vec!["discover_tools", "get_tool_schema", "execute_tool", "refresh_registry"]
    );

    gateway.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn custom_instructions_override_dynamic_text() -> anyhow::Result<()> {
    let apollo = MockUpstream::start().await?;
    apollo.set_tools(vec![tool("people_search", "Find people")]);

    let mut config = gateway_config(vec![upstream("apollo", &apollo.url())]);
    config.instructions = Some("use the tools wisely".to_string());
    let gateway = start_gateway(config, Vec::new()).await?;

    let client = reqwest::Client::new();
    let init: Value = client
        .post(format!("{}/mcp", gateway.base_url()))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "probe", "version": "0"},
            },
        }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(init["result"]["instructions"], "use the tools wisely");

    gateway.shutdown().await;
    Ok(())
}
