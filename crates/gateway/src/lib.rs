//! Progressive tool-discovery gateway for the Model Context Protocol.
//!
//! Sits between MCP clients and any number of upstream MCP servers. Instead
//! of advertising every upstream tool schema at once, the gateway exposes
//! four meta-tools (`discover_tools`, `get_tool_schema`, `execute_tool`,
//! `refresh_registry`) that let an LLM browse tool metadata, fetch one schema
//! on demand, and route executions to the owning upstream with per-request
//! user context attached.

pub mod admin;
pub mod config;
pub mod error;
pub mod hooks;
pub mod mcp;
pub mod registry;
pub mod server;
pub mod streamable_http;
pub mod upstream;
