//! Dynamic registration API.
//!
//! Mounted only when a registration token is configured. Every request needs
//! `Authorization: Bearer <token>`; the comparison is timing-safe.

use crate::server::Instructions;
use crate::upstream::{UpstreamConfig, UpstreamManager};
use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde_json::{Value, json};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Tokens shorter than this trigger a startup warning.
pub const MIN_TOKEN_LENGTH: usize = 16;

#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<UpstreamManager>,
    pub instructions: Arc<Instructions>,
    pub sessions: Arc<crate::mcp::SessionRegistry>,
    pub token: String,
}

pub fn router() -> Router {
    Router::new()
        .route("/registry/servers", get(list_servers).post(register_server))
        .route("/registry/servers/{domain}", delete(deregister_server))
}

/// Constant-time string equality.
///
/// Comparing fixed-size digests keeps the comparison independent of where the
/// first mismatching byte falls.
#[must_use]
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    let mut diff = 0u8;
    for (x, y) in da.iter().zip(db.iter()) {
        diff |= x ^ y;
    }
    diff == 0 && a.len() == b.len()
}

fn authorize(state: &AdminState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if timing_safe_eq(token, &state.token) => Ok(()),
        Some(_) => Err((StatusCode::UNAUTHORIZED, "invalid registration token").into_response()),
        None => Err((StatusCode::UNAUTHORIZED, "bearer token is required").into_response()),
    }
}

async fn list_servers(
    Extension(state): Extension<Arc<AdminState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }

    let servers: Vec<Value> = state
        .manager
        .servers_snapshot()
        .into_iter()
        .map(|(domain, url, tool_count)| {
            json!({"domain": domain, "url": url, "tool_count": tool_count})
        })
        .collect();
    Json(json!({"servers": servers})).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

/// Validate and unpack a registration body.
fn parse_registration(body: &Value) -> Result<UpstreamConfig, Response> {
    let Some(obj) = body.as_object() else {
        return Err(bad_request("body must be a JSON object"));
    };

    let domain = obj
        .get("domain")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if domain.is_empty() {
        return Err(bad_request("domain is required"));
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(bad_request(
            "domain may only contain alphanumerics, '_' and '-'",
        ));
    }

    let Some(url) = obj.get("url").and_then(Value::as_str) else {
        return Err(bad_request("url is required"));
    };
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(parsed) => {
            return Err(bad_request(&format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }
        Err(e) => return Err(bad_request(&format!("invalid url: {e}"))),
    }

    let description = match obj.get("description") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(bad_request("description must be a string")),
    };

    let mut static_headers = HashMap::new();
    match obj.get("headers") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, value) in map {
                let Some(value) = value.as_str() else {
                    return Err(bad_request("headers must map strings to strings"));
                };
                static_headers.insert(name.clone(), value.to_string());
            }
        }
        Some(_) => return Err(bad_request("headers must be an object")),
    }

    Ok(UpstreamConfig {
        domain: domain.to_string(),
        url: url.to_string(),
        description,
        static_headers,
    })
}

async fn register_server(
    Extension(state): Extension<Arc<AdminState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let config = match parse_registration(&body) {
        Ok(config) => config,
        Err(resp) => return resp,
    };

    tracing::info!(domain = %config.domain, url = %config.url, "registering upstream");
    let diff = state.manager.add_upstream(config).await;
    state.instructions.rebuild(state.manager.registry());
    if !diff.is_empty() {
        state.sessions.notify_tools_list_changed();
    }
    Json(serde_json::to_value(&diff).unwrap_or_else(|_| json!({}))).into_response()
}

async fn deregister_server(
    Extension(state): Extension<Arc<AdminState>>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }

    let had_tools = state.manager.registry().tool_count(&domain) > 0;
    if !state.manager.remove_upstream(&domain) {
        return (StatusCode::NOT_FOUND, "unknown domain").into_response();
    }
    tracing::info!(domain = %domain, "deregistered upstream");
    state.instructions.rebuild(state.manager.registry());
    if had_tools {
        state.sessions.notify_tools_list_changed();
    }
    Json(json!({"ok": true})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_safe_eq_matches_equal_strings() {
        assert!(timing_safe_eq("secret-token-abcdef", "secret-token-abcdef"));
        assert!(!timing_safe_eq("secret-token-abcdef", "secret-token-abcdeg"));
        assert!(!timing_safe_eq("short", "longer-token"));
    }

    #[test]
    fn registration_body_validation() {
        let ok = parse_registration(&json!({
            "domain": "apollo",
            "url": "https://apollo.example/mcp",
            "headers": {"x-api-key": "k"},
        }))
        .expect("valid body");
        assert_eq!(ok.domain, "apollo");
        assert_eq!(ok.static_headers.get("x-api-key").map(String::as_str), Some("k"));

        assert!(parse_registration(&json!({"url": "https://x.example"})).is_err());
        assert!(parse_registration(&json!({"domain": "a", "url": "ftp://x.example"})).is_err());
        assert!(parse_registration(&json!({"domain": "a", "url": "not a url"})).is_err());
        assert!(
            parse_registration(&json!({
                "domain": "a",
                "url": "https://x.example",
                "headers": {"k": 1},
            }))
            .is_err()
        );
        assert!(parse_registration(&json!({"domain": "bad domain!", "url": "https://x.example"})).is_err());
    }
}
