//! tooldex-mcp: MCP stdio server for the agent pane.
//!
//! Launched by the agent (as an MCP server entry) inside an activation.
//! The primary pane comes from `--primary-pane`, `TOOLDEX_PRIMARY_PANE`
//! or `TMUX_PANE`, in that order.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tooldex_core::supervisor::ACTIVATION_ENV;
use tooldex_core::{
    resolve_primary_pane, ActivationId, SubscriptionManager, TmuxAdapter, TmuxConfig,
};
use tooldex_mcp::{McpServer, ToolContext};

/// tooldex-mcp: expose the primary tmux pane to an AI agent
#[derive(Parser, Debug)]
#[command(name = "tooldex-mcp", version, about = "MCP server exposing the primary tmux pane")]
struct Cli {
    /// Pane to drive (default: $TOOLDEX_PRIMARY_PANE, then $TMUX_PANE)
    #[arg(long)]
    primary_pane: Option<String>,

    /// tmux executable
    #[arg(long, default_value = "tmux")]
    tmux: String,

    /// tmux socket name (-L)
    #[arg(long)]
    tmux_socket: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("tooldex-mcp: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let primary = resolve_primary_pane(cli.primary_pane.as_deref())
        .context("set TOOLDEX_PRIMARY_PANE before launching the MCP server")?;

    let owner = std::env::var(ACTIVATION_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(ActivationId)
        .unwrap_or(ActivationId(0));

    let mux = Arc::new(TmuxAdapter::new(TmuxConfig {
        binary: cli.tmux,
        socket: cli.tmux_socket,
        ..TmuxConfig::default()
    }));
    let subscriptions = Arc::new(SubscriptionManager::new(mux));
    let server = McpServer::new(ToolContext::new(primary, subscriptions, owner));

    info!(%owner, "serving on stdio");
    server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("stdio")?;
    info!("stdin closed, exiting");
    Ok(())
}
