//! Environment-variable configuration.
//!
//! Every setting doubles as a CLI flag (clap's `env` support), so
//! `GATEWAY_UPSTREAMS='{"apollo": "https://..."}' fastmcp-gateway` and
//! `fastmcp-gateway --upstreams '...'` are equivalent. JSON-valued variables
//! are validated here; a parse failure aborts startup with a non-zero exit.

use crate::error::{GatewayError, Result};
use crate::upstream::UpstreamConfig;
use clap::Parser;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "fastmcp-gateway", version, about = "Progressive tool-discovery gateway for MCP")]
pub struct Cli {
    /// JSON object mapping domain names to upstream MCP endpoint URLs.
    #[arg(long, env = "GATEWAY_UPSTREAMS")]
    pub upstreams: String,

    /// Server name advertised in the MCP handshake.
    #[arg(long, env = "GATEWAY_NAME", default_value = "fastmcp-gateway")]
    pub name: String,

    #[arg(long, env = "GATEWAY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Static instructions text; overrides the dynamically built one.
    #[arg(long, env = "GATEWAY_INSTRUCTIONS")]
    pub instructions: Option<String>,

    /// Bearer token attached to the discovery client for every upstream.
    #[arg(long, env = "GATEWAY_REGISTRY_AUTH_TOKEN")]
    pub registry_auth_token: Option<String>,

    /// JSON object mapping domain names to human descriptions.
    #[arg(long, env = "GATEWAY_DOMAIN_DESCRIPTIONS")]
    pub domain_descriptions: Option<String>,

    /// JSON object mapping domain names to static header maps.
    #[arg(long, env = "GATEWAY_UPSTREAM_HEADERS")]
    pub upstream_headers: Option<String>,

    /// Background refresh interval in seconds; absent or <= 0 disables it.
    #[arg(long, env = "GATEWAY_REFRESH_INTERVAL")]
    pub refresh_interval: Option<i64>,

    /// Name of a compiled-in hook set (see `hooks::register_hook_factory`).
    #[arg(long, env = "GATEWAY_HOOK_MODULE")]
    pub hook_module: Option<String>,

    /// Enables the /registry registration API when set.
    #[arg(long, env = "GATEWAY_REGISTRATION_TOKEN")]
    pub registration_token: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub instructions: Option<String>,
    pub registry_auth_token: Option<String>,
    pub upstreams: Vec<UpstreamConfig>,
    pub refresh_interval: Option<Duration>,
    pub hook_module: Option<String>,
    pub registration_token: Option<String>,
    pub log_level: String,
}

impl GatewayConfig {
    /// # Errors
    ///
    /// Returns a configuration error for malformed JSON values or invalid
    /// upstream URLs.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let urls: BTreeMap<String, String> = serde_json::from_str(&cli.upstreams)
            .map_err(|e| GatewayError::Config(format!("GATEWAY_UPSTREAMS is not valid JSON: {e}")))?;
        if urls.is_empty() {
            return Err(GatewayError::Config(
                "GATEWAY_UPSTREAMS must name at least one upstream".to_string(),
            ));
        }

        let mut descriptions: BTreeMap<String, String> = BTreeMap::new();
        if let Some(raw) = &cli.domain_descriptions {
            descriptions = serde_json::from_str(raw).map_err(|e| {
                GatewayError::Config(format!("GATEWAY_DOMAIN_DESCRIPTIONS is not valid JSON: {e}"))
            })?;
        }

        let mut headers: BTreeMap<String, HashMap<String, String>> = BTreeMap::new();
        if let Some(raw) = &cli.upstream_headers {
            headers = serde_json::from_str(raw).map_err(|e| {
                GatewayError::Config(format!("GATEWAY_UPSTREAM_HEADERS is not valid JSON: {e}"))
            })?;
        }

        let mut upstreams = Vec::with_capacity(urls.len());
        for (domain, url) in urls {
            match reqwest::Url::parse(&url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(parsed) => {
                    return Err(GatewayError::Config(format!(
                        "upstream '{domain}' has unsupported url scheme '{}'",
                        parsed.scheme()
                    )));
                }
                Err(e) => {
                    return Err(GatewayError::Config(format!(
                        "upstream '{domain}' has an invalid url: {e}"
                    )));
                }
            }
            upstreams.push(UpstreamConfig {
                description: descriptions.get(&domain).cloned(),
                static_headers: headers.get(&domain).cloned().unwrap_or_default(),
                domain,
                url,
            });
        }

        let refresh_interval = cli
            .refresh_interval
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs.unsigned_abs()));

        Ok(Self {
            name: cli.name,
            host: cli.host,
            port: cli.port,
            instructions: cli.instructions,
            registry_auth_token: cli.registry_auth_token,
            upstreams,
            refresh_interval,
            hook_module: cli.hook_module,
            registration_token: cli.registration_token,
            log_level: cli.log_level,
        })
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
