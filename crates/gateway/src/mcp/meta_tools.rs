//! The four LLM-facing meta-tools.
//!
//! Every response is a JSON value (the MCP layer serializes it into a text
//! content block). Failures use the uniform envelope from [`crate::error`];
//! internal errors never cross this boundary unshaped.

use super::McpState;
use crate::error::{ErrorCode, error_body};
use crate::hooks::{ExecutionContext, ExecutionDecision, ListToolsContext};
use crate::registry::{ToolEntry, rank_candidates, resolve_candidate};
use axum::http::HeaderMap;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Dispatch one meta-tool invocation. Returns the response body and whether
/// it represents an error.
pub async fn dispatch(
    state: &McpState,
    headers: &HeaderMap,
    tool: &str,
    arguments: Option<Map<String, Value>>,
) -> (Value, bool) {
    let args = arguments.unwrap_or_default();
    tracing::debug!(tool = %tool, "meta-tool invoked");
    match tool {
        "discover_tools" => discover_tools(state, headers, &args).await,
        "get_tool_schema" => get_tool_schema(state, headers, &args).await,
        "execute_tool" => execute_tool(state, headers, &args).await,
        "refresh_registry" => refresh_registry(state).await,
        other => (
            error_body(
                ErrorCode::ToolNotFound.as_str(),
                format!(
                    "unknown tool '{other}'; this gateway exposes discover_tools, \
                     get_tool_schema, execute_tool and refresh_registry"
                ),
                None,
            ),
            true,
        ),
    }
}

fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn tool_item(entry: &ToolEntry, with_domain: bool) -> Value {
    let mut item = Map::new();
    item.insert("name".to_string(), Value::String(entry.name.clone()));
    if with_domain {
        item.insert("domain".to_string(), Value::String(entry.domain.clone()));
    }
    if let Some(group) = &entry.group {
        item.insert("group".to_string(), Value::String(group.clone()));
    }
    item.insert(
        "description".to_string(),
        Value::String(entry.description.clone()),
    );
    Value::Object(item)
}

fn matches_query(entry: &ToolEntry, needle: &str) -> bool {
    entry.name.to_lowercase().contains(needle)
        || entry.description.to_lowercase().contains(needle)
}

async fn discover_tools(
    state: &McpState,
    headers: &HeaderMap,
    args: &Map<String, Value>,
) -> (Value, bool) {
    let domain = arg_str(args, "domain");
    let group = arg_str(args, "group");
    let query = arg_str(args, "query");

    if group.is_some() && domain.is_none() {
        return (
            error_body(
                ErrorCode::GroupNotFound.as_str(),
                "the group filter requires a domain",
                None,
            ),
            true,
        );
    }

    let user = state.hooks.authenticate(headers).await;
    let ctx = ListToolsContext {
        domain: domain.map(str::to_string),
        headers: headers.clone(),
        user,
    };

    if let Some(domain) = domain {
        let Some(entries) = state.registry.domain_entries(domain) else {
            let valid: Vec<String> = state
                .registry
                .list_domains()
                .into_iter()
                .map(|d| d.name)
                .collect();
            return (
                error_body(
                    ErrorCode::DomainNotFound.as_str(),
                    format!("unknown domain '{domain}'"),
                    Some(json!({"valid_domains": valid})),
                ),
                true,
            );
        };
        let entries = state.hooks.after_list_tools(&ctx, entries).await;

        if let Some(group) = group {
            let valid: std::collections::BTreeSet<String> =
                entries.iter().filter_map(|e| e.group.clone()).collect();
            if !valid.contains(group) {
                return (
                    error_body(
                        ErrorCode::GroupNotFound.as_str(),
                        format!("unknown group '{group}' in domain '{domain}'"),
                        Some(json!({"valid_groups": valid.into_iter().collect::<Vec<_>>()})),
                    ),
                    true,
                );
            }
            let tools: Vec<Value> = entries
                .iter()
                .filter(|e| e.group.as_deref() == Some(group))
                .map(|e| json!({"name": e.name, "description": e.description}))
                .collect();
            return (
                json!({"domain": domain, "group": group, "tools": tools}),
                false,
            );
        }

        let mut body = Map::new();
        body.insert("domain".to_string(), Value::String(domain.to_string()));
        let entries: Vec<Arc<ToolEntry>> = match query {
            Some(q) => {
                let needle = q.to_lowercase();
                body.insert("query".to_string(), Value::String(q.to_string()));
                entries
                    .into_iter()
                    .filter(|e| matches_query(e, &needle))
                    .collect()
            }
            None => entries,
        };
        let tools: Vec<Value> = entries.iter().map(|e| tool_item(e, false)).collect();
        body.insert("tools".to_string(), Value::Array(tools));
        return (Value::Object(body), false);
    }

    let entries = state
        .hooks
        .after_list_tools(&ctx, state.registry.all_entries())
        .await;

    if let Some(query) = query {
        let needle = query.to_lowercase();
        let results: Vec<Value> = entries
            .iter()
            .filter(|e| matches_query(e, &needle))
            .map(|e| tool_item(e, true))
            .collect();
        return (json!({"query": query, "results": results}), false);
    }

    // Domain summary, rebuilt from the hook-filtered entry set so counts and
    // group sets stay consistent with what this caller can actually see.
    let mut per_domain: std::collections::HashMap<&str, (usize, std::collections::BTreeSet<&str>)> =
        std::collections::HashMap::new();
    for entry in &entries {
        let slot = per_domain.entry(entry.domain.as_str()).or_default();
        slot.0 += 1;
        if let Some(group) = &entry.group {
            slot.1.insert(group.as_str());
        }
    }

    let mut domains: Vec<Value> = Vec::new();
    for info in state.registry.list_domains() {
        let (count, groups) = per_domain
            .get(info.name.as_str())
            .map(|(c, g)| (*c, g.iter().map(|s| (*s).to_string()).collect::<Vec<_>>()))
            .unwrap_or_default();
        let mut item = Map::new();
        item.insert("name".to_string(), Value::String(info.name));
        if let Some(description) = info.description {
            item.insert("description".to_string(), Value::String(description));
        }
        item.insert("tool_count".to_string(), Value::from(count));
        item.insert("groups".to_string(), json!(groups));
        domains.push(Value::Object(item));
    }

    (
        json!({"domains": domains, "total_tools": entries.len()}),
        false,
    )
}

async fn get_tool_schema(
    state: &McpState,
    headers: &HeaderMap,
    args: &Map<String, Value>,
) -> (Value, bool) {
    let tool_name = arg_str(args, "tool_name").unwrap_or_default();

    let user = state.hooks.authenticate(headers).await;
    let ctx = ListToolsContext {
        domain: None,
        headers: headers.clone(),
        user,
    };
    // Hidden tools must behave exactly like missing ones, suggestions
    // included, so everything below works on the filtered view.
    let visible = state
        .hooks
        .after_list_tools(&ctx, state.registry.all_entries())
        .await;

    let exact = visible.iter().find(|e| e.name == tool_name);
    if let Some(entry) = exact {
        return (schema_body(entry), false);
    }

    let ranked = rank_candidates(tool_name, visible.iter().map(|e| e.name.as_str()));
    if let Some(best) = resolve_candidate(&ranked)
        && let Some(entry) = visible.iter().find(|e| e.name == best)
    {
        tracing::debug!(requested = %tool_name, resolved = %best, "fuzzy-resolved tool name");
        return (schema_body(entry), false);
    }

    let suggestions: Vec<String> = ranked.into_iter().map(|(name, _)| name).collect();
    let details = if suggestions.is_empty() {
        None
    } else {
        Some(json!({"suggestions": suggestions}))
    };
    (
        error_body(
            ErrorCode::ToolNotFound.as_str(),
            format!("tool '{tool_name}' not found"),
            details,
        ),
        true,
    )
}

fn schema_body(entry: &ToolEntry) -> Value {
    let mut body = Map::new();
    body.insert("name".to_string(), Value::String(entry.name.clone()));
    body.insert("domain".to_string(), Value::String(entry.domain.clone()));
    if let Some(group) = &entry.group {
        body.insert("group".to_string(), Value::String(group.clone()));
    }
    body.insert(
        "description".to_string(),
        Value::String(entry.description.clone()),
    );
    body.insert("parameters".to_string(), entry.input_schema.clone());
    Value::Object(body)
}

async fn execute_tool(
    state: &McpState,
    headers: &HeaderMap,
    args: &Map<String, Value>,
) -> (Value, bool) {
    let tool_name = arg_str(args, "tool_name").unwrap_or_default();

    // Executions never fuzzy-resolve: a side-effecting call must name its
    // target exactly. Near-misses come back as suggestions instead.
    let Some(entry) = state.registry.get(tool_name) else {
        let suggestions = state.registry.suggestions_for(tool_name);
        let details = if suggestions.is_empty() {
            None
        } else {
            Some(json!({"suggestions": suggestions}))
        };
        return (
            error_body(
                ErrorCode::ToolNotFound.as_str(),
                format!("tool '{tool_name}' not found"),
                details,
            ),
            true,
        );
    };

    let arguments = match args.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return (
                error_body(
                    ErrorCode::ExecutionError.as_str(),
                    "arguments must be a JSON object",
                    None,
                ),
                true,
            );
        }
    };

    let user = state.hooks.authenticate(headers).await;
    let mut ctx = ExecutionContext::new(Arc::clone(&entry), arguments, headers.clone(), user);

    if let ExecutionDecision::Deny { code, message } = state.hooks.before_execute(&mut ctx).await {
        tracing::debug!(tool = %entry.name, code = %code, "execution denied by hook");
        return (error_body(&code, message, None), true);
    }

    let outcome = state
        .manager
        .execute(&entry, ctx.arguments.clone(), &ctx.headers, &ctx.extra_headers)
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            state.hooks.on_error(&ctx, &e).await;
            return (
                error_body(ErrorCode::UpstreamError.as_str(), e.to_string(), None),
                true,
            );
        }
    };

    let is_error = outcome.is_error;
    let result = state
        .hooks
        .after_execute(&mut ctx, outcome.result, is_error)
        .await;

    if is_error {
        let text = error_text(&result)
            .unwrap_or_else(|| format!("tool '{}' reported an error", entry.name));
        return (
            json!({
                "tool": entry.name,
                "error": text,
                "code": ErrorCode::ExecutionError.as_str(),
            }),
            true,
        );
    }

    (json!({"tool": entry.name, "result": result}), false)
}

/// First text block of an upstream error result.
fn error_text(result: &Value) -> Option<String> {
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks
                .iter()
                .find_map(|b| b.get("text").and_then(Value::as_str))
        })
        .map(str::to_string)
}

async fn refresh_registry(state: &McpState) -> (Value, bool) {
    let report = state.manager.refresh_all().await;
    state.instructions.rebuild(&state.registry);
    if report.changed() {
        state.sessions.notify_tools_list_changed();
    }

    let diffs = serde_json::to_value(&report.diffs).unwrap_or_else(|_| json!([]));
    (json!({"diffs": diffs, "failed": report.failed}), false)
}
