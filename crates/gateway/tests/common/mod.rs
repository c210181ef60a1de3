#![allow(dead_code)]

use fastmcp_gateway::config::GatewayConfig;
use fastmcp_gateway::hooks::GatewayHook;
use fastmcp_gateway::server::{GatewayServer, RunningGateway};
use fastmcp_gateway::upstream::UpstreamConfig;
use std::collections::HashMap;
use std::sync::Arc;

pub fn upstream(domain: &str, url: &str) -> UpstreamConfig {
    UpstreamConfig {
        domain: domain.to_string(),
        url: url.to_string(),
        description: None,
        static_headers: HashMap::new(),
    }
}

pub fn gateway_config(upstreams: Vec<UpstreamConfig>) -> GatewayConfig {
    GatewayConfig {
        name: "fastmcp-gateway".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        instructions: None,
        registry_auth_token: None,
        upstreams,
        refresh_interval: None,
        hook_module: None,
        registration_token: None,
        log_level: "info".to_string(),
    }
}

/// Build, populate, and serve a gateway on an ephemeral port.
pub async fn start_gateway(
    config: GatewayConfig,
    hooks: Vec<Arc<dyn GatewayHook>>,
) -> anyhow::Result<RunningGateway> {
    let server = GatewayServer::new(config, hooks)?;
    server.populate().await;
    server.start("127.0.0.1:0").await
}
