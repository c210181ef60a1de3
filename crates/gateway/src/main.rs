use anyhow::Context as _;
use clap::Parser as _;
use fastmcp_gateway::config::{Cli, GatewayConfig};
use fastmcp_gateway::hooks::resolve_hooks;
use fastmcp_gateway::server::GatewayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = GatewayConfig::from_cli(cli).context("invalid configuration")?;
    let hooks = resolve_hooks(config.hook_module.as_deref()).context("invalid hook module")?;
    let bind_addr = config.bind_addr();

    let server = GatewayServer::new(config, hooks)?;
    let diffs = server.populate().await;
    tracing::info!(
        domains = diffs.len(),
        tools = server.registry().total_tools(),
        "registry populated"
    );

    let running = server.start(&bind_addr).await?;
    shutdown_signal().await;
    running.shutdown().await;
    Ok(())
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid LOG_LEVEL '{log_level}'"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}
