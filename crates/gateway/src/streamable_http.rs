//! MCP streamable-HTTP client plumbing shared by discovery and execution
//! connections.
//!
//! Upstream responses are handled as raw JSON-RPC values instead of typed SDK
//! models so that vendor extensions (`_meta`, unknown annotation keys) pass
//! through the gateway untouched. Both the plain-JSON and the SSE response
//! variants of the transport are accepted and treated as interchangeable
//! after connect.

use axum::http::HeaderMap;
use futures::{StreamExt as _, stream::BoxStream};
use rmcp::transport::common::http_header::{
    EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, JSON_MIME_TYPE,
};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Http(String),

    #[error("upstream http {0}")]
    Status(reqwest::StatusCode),

    #[error("unexpected content type {0:?}")]
    ContentType(Option<String>),

    #[error("invalid json from upstream: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sse stream error: {0}")]
    Sse(String),

    /// The upstream answered with a JSON-RPC error object.
    #[error("upstream rpc error: {0}")]
    Rpc(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}

type SseEvents = BoxStream<'static, Result<sse_stream::Sse, sse_stream::Error>>;

enum PostResponse {
    Accepted,
    Json(Value, Option<String>),
    Sse(SseEvents, Option<String>),
}

/// One logical MCP client connection over streamable HTTP.
///
/// Holds the endpoint URL plus the headers attached to every request; the
/// underlying `reqwest::Client` is shared and cheap to clone.
#[derive(Clone)]
pub struct McpHttpClient {
    http: reqwest::Client,
    url: Arc<str>,
    headers: HeaderMap,
}

impl McpHttpClient {
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<Arc<str>>, headers: HeaderMap) -> Self {
        Self {
            http,
            url: url.into(),
            headers,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Perform the MCP handshake (`initialize` + `notifications/initialized`)
    /// and return the session id, if the server issued one.
    pub async fn initialize(&self, client_name: &str) -> Result<Option<String>, TransportError> {
        let init = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": client_name, "version": env!("CARGO_PKG_VERSION")},
            },
        });

        let (message, session_id) = match self.post(&init, None).await? {
            PostResponse::Json(v, sid) => (v, sid),
            PostResponse::Sse(stream, sid) => (first_response(stream).await?, sid),
            PostResponse::Accepted => {
                return Err(TransportError::Protocol(
                    "initialize was accepted without a result".to_string(),
                ));
            }
        };
        rpc_result(message)?;

        // The client must confirm the handshake before the session is usable.
        let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        match self.post(&initialized, session_id.as_deref()).await? {
            PostResponse::Accepted => {}
            _ => {
                return Err(TransportError::Protocol(
                    "unexpected response to notifications/initialized".to_string(),
                ));
            }
        }

        Ok(session_id)
    }

    /// Send one JSON-RPC request and return its `result` value.
    pub async fn request(
        &self,
        message: &Value,
        session_id: Option<&str>,
    ) -> Result<Value, TransportError> {
        match self.post(message, session_id).await? {
            PostResponse::Json(v, _) => rpc_result(v),
            PostResponse::Sse(stream, _) => rpc_result(first_response(stream).await?),
            PostResponse::Accepted => Err(TransportError::Protocol(
                "request was accepted without a result".to_string(),
            )),
        }
    }

    /// Best-effort session teardown.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), TransportError> {
        let mut req = self.http.delete(self.url.as_ref());
        req = req.header(HEADER_SESSION_ID, session_id);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        req.send().await?;
        Ok(())
    }

    async fn post(
        &self,
        message: &Value,
        session_id: Option<&str>,
    ) -> Result<PostResponse, TransportError> {
        let mut req = self
            .http
            .post(self.url.as_ref())
            .header(reqwest::header::CONTENT_TYPE, JSON_MIME_TYPE)
            .header(
                reqwest::header::ACCEPT,
                format!("{JSON_MIME_TYPE}, {EVENT_STREAM_MIME_TYPE}"),
            )
            .json(message);

        if let Some(sid) = session_id {
            req = req.header(HEADER_SESSION_ID, sid);
        }
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(PostResponse::Accepted);
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(TransportError::Status(status));
        }

        let session_id = resp
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        match content_type(resp.headers()).as_deref() {
            Some(ct) if ct.eq_ignore_ascii_case(EVENT_STREAM_MIME_TYPE) => {
                let stream: SseEvents =
                    sse_stream::SseStream::from_byte_stream(resp.bytes_stream()).boxed();
                Ok(PostResponse::Sse(stream, session_id))
            }
            Some(ct) if ct.eq_ignore_ascii_case(JSON_MIME_TYPE) => {
                let v: Value = resp.json().await?;
                Ok(PostResponse::Json(v, session_id))
            }
            other => Err(TransportError::ContentType(
                other.map(std::string::ToString::to_string),
            )),
        }
    }
}

fn content_type(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
}

/// Read SSE events until the first JSON-RPC response message.
async fn first_response(mut stream: SseEvents) -> Result<Value, TransportError> {
    while let Some(event) = stream.next().await {
        let event = event.map_err(|e| TransportError::Sse(e.to_string()))?;
        let payload = event.data.unwrap_or_default();
        if payload.trim().is_empty() {
            continue;
        }
        let message: Value = serde_json::from_str(&payload)?;
        if message.get("id").is_some()
            && (message.get("result").is_some() || message.get("error").is_some())
        {
            return Ok(message);
        }
    }
    Err(TransportError::Sse(
        "stream ended before a response arrived".to_string(),
    ))
}

/// Unwrap a JSON-RPC message into its `result`, mapping `error` objects.
fn rpc_result(message: Value) -> Result<Value, TransportError> {
    if let Some(err) = message.get("error") {
        let text = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(TransportError::Rpc(text.to_string()));
    }
    message
        .get("result")
        .cloned()
        .ok_or_else(|| TransportError::Protocol("message without result".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_result_unwraps_result() {
        let v = json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}});
        assert_eq!(rpc_result(v).expect("result")["ok"], true);
    }

    #[test]
    fn rpc_result_maps_error_objects() {
        let v = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "nope"}});
        match rpc_result(v) {
            Err(TransportError::Rpc(msg)) => assert_eq!(msg, "nope"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
