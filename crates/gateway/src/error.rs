//! Error taxonomy for the gateway.
//!
//! Internal failures are modeled with [`GatewayError`]; everything that
//! crosses the meta-tool boundary is shaped into the uniform JSON envelope
//! `{"error": ..., "code": ..., "details": {...}}` via [`error_body`].

use serde_json::{Value, json};
use thiserror::Error;

/// Stable error codes surfaced to MCP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ToolNotFound,
    DomainNotFound,
    GroupNotFound,
    ExecutionError,
    UpstreamError,
    RefreshError,
    Forbidden,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolNotFound => "tool_not_found",
            Self::DomainNotFound => "domain_not_found",
            Self::GroupNotFound => "group_not_found",
            Self::ExecutionError => "execution_error",
            Self::UpstreamError => "upstream_error",
            Self::RefreshError => "refresh_error",
            Self::Forbidden => "forbidden",
        }
    }
}

/// Main error type for gateway internals.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration errors (invalid JSON, missing variables, unknown hook set).
    #[error("configuration error: {0}")]
    Config(String),

    /// The named domain is not registered.
    #[error("unknown domain '{0}'")]
    DomainNotFound(String),

    /// Upstream transport or protocol failure.
    #[error("upstream '{domain}' request failed: {message}")]
    Upstream { domain: String, message: String },

    /// Anything that should never leak details to the client.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Build the LLM-facing error envelope.
///
/// `details` is omitted from the payload when `None`.
#[must_use]
pub fn error_body(code: &str, error: impl Into<String>, details: Option<Value>) -> Value {
    let mut body = json!({
        "error": error.into(),
        "code": code,
    });
    if let (Some(obj), Some(details)) = (body.as_object_mut(), details) {
        obj.insert("details".to_string(), details);
    }
    body
}
