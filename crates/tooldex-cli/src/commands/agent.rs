//! `tooldex agent`: start the agent binary with tooldex configuration.
//!
//! Runs inside the agent pane. Loads `codex.toml`, points the terminal MCP
//! server at the primary pane, and forwards the agent's exit code.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use tooldex_core::pane::PRIMARY_PANE_ENV;
use tooldex_core::resolve_primary_pane;
use tooldex_core::supervisor::ACTIVATION_ENV;

use crate::config::{self, AgentConfig, SearchPaths};

/// Build the agent argv for `config`, given the current primary pane and
/// activation (when known).
pub fn prepare_command(
    config: &AgentConfig,
    primary_pane: Option<&str>,
    activation: Option<&str>,
    extra: &[String],
) -> Result<Vec<String>> {
    let mut overrides = config.overrides.clone();
    if let Some(server) = &config.terminal_mcp {
        match primary_pane {
            Some(pane) => {
                let mut vars = vec![(PRIMARY_PANE_ENV, pane)];
                if let Some(id) = activation {
                    vars.push((ACTIVATION_ENV, id));
                }
                config::inject_mcp_env(&mut overrides, server, &vars)?;
            }
            None => eprintln!(
                "warning: {PRIMARY_PANE_ENV} not set; the terminal MCP server may not find the pane."
            ),
        }
    }
    Ok(config::build_command(config, &overrides, extra))
}

pub async fn run(config_path: Option<&str>, args: &[String]) -> Result<i32> {
    let source = config::resolve_config_path(config_path, &SearchPaths::from_env())?;
    let config = AgentConfig::load(&source)?;
    info!(config = %source, binary = %config.binary, "agent config loaded");

    let extra = match args.first().map(String::as_str) {
        Some("--") => &args[1..],
        _ => args,
    };

    let primary = resolve_primary_pane(None).ok();
    let activation = std::env::var(ACTIVATION_ENV).ok();
    let command = prepare_command(
        &config,
        primary.as_ref().map(|p| p.as_str()),
        activation.as_deref(),
        extra,
    )?;

    let status = match tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .envs(&config.env)
        .status()
        .await
    {
        Ok(status) => status,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("agent binary '{}' was not found on PATH", config.binary)
        }
        Err(e) => return Err(e).context(format!("failed to start '{}'", config.binary)),
    };

    let code = status.code().unwrap_or(1);
    if code != 0 {
        warn!(code, "agent exited with failure");
        eprintln!(
            "warning: agent exited with status {code}. Command: {}",
            config::shell_join(&command)
        );
    }
    Ok(code)
}
