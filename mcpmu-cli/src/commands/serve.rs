//! The `serve` command: run the gateway as a stdio MCP server

use std::path::Path;

use anyhow::Result;
use tracing::info;

use mcpmu_mcp::GatewayServer;
use mcpmu_runtime::RuntimeContext;

pub async fn serve(
    config_path: Option<&Path>,
    namespace: Option<&str>,
    expose_manager_tools: bool,
) -> Result<()> {
    let ctx = RuntimeContext::initialize(config_path).await?;
    let aggregator = ctx.aggregator(namespace).await;
    let watcher = ctx.watch_config().await?;
    ctx.start_autostart().await;

    let server = GatewayServer::new(aggregator, ctx.bus.clone())
        .expose_manager_tools(expose_manager_tools);

    tokio::select! {
        result = server.serve_stdio() => {
            // Upstream closed stdin: the client is done with us.
            result?;
            info!("upstream disconnected");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    watcher.stop().await;
    ctx.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
