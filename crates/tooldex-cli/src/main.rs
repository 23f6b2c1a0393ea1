//! tooldex: open an AI agent next to a running terminal program.
//!
//! `tooldex wrap` hosts a program and opens the agent pane on demand,
//! `tooldex agent` launches the configured agent inside that pane, and
//! `tooldex pane` drives the primary pane by hand.

mod commands;
mod config;
mod hotkey;
mod terminal;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::error;
use tracing_subscriber::EnvFilter;

use tooldex_core::{
    resolve_primary_pane, CaptureOptions, SubscribeOptions, TmuxAdapter, TmuxConfig,
};

/// Log file used when `--log-file` is not given.
const LOG_ENV: &str = "TOOLDEX_LOG";

/// tooldex: agent pane for any terminal program
#[derive(Parser)]
#[command(name = "tooldex", version, about = "Open an AI agent next to a running terminal program")]
struct Cli {
    /// Write logs to this file (default: $TOOLDEX_LOG)
    #[arg(long, global = true)]
    log_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a program in a PTY with the agent hotkey
    Wrap(commands::wrap::WrapArgs),

    /// Launch the configured agent (run inside the agent pane)
    Agent {
        /// Config file path
        #[arg(short = 'c', long)]
        config: Option<String>,

        /// Extra arguments passed to the agent
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Send to, read or watch the primary pane
    Pane {
        /// Pane to use (default: $TOOLDEX_PRIMARY_PANE, then $TMUX_PANE)
        #[arg(long, global = true)]
        primary_pane: Option<String>,

        #[command(subcommand)]
        action: PaneCommand,
    },
}

#[derive(Subcommand)]
enum PaneCommand {
    /// Type text into the pane
    Send {
        text: String,

        /// Do not press Enter afterwards
        #[arg(long)]
        no_enter: bool,
    },

    /// Print the pane's recent output
    Read {
        /// Lines to capture
        #[arg(long, default_value_t = tooldex_core::capture::DEFAULT_READ_LINES)]
        lines: usize,

        /// Keep ANSI colours
        #[arg(long)]
        colors: bool,

        /// Print the full read result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream new output until Ctrl-C
    Watch {
        /// Recent lines to print first
        #[arg(long, default_value_t = 0)]
        initial_lines: usize,

        /// Keep ANSI colours
        #[arg(long)]
        colors: bool,

        /// Seconds each fetch waits for output
        #[arg(long, default_value_t = 1.0)]
        timeout: f64,

        /// Lines per fetch
        #[arg(long, default_value_t = tooldex_core::poll::DEFAULT_MAX_LINES)]
        max_lines: usize,

        /// Seconds between captures
        #[arg(long, default_value_t = 0.2)]
        poll_interval: f64,

        /// Stop after this many fetches
        #[arg(long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("tooldex: {e:#}");
        std::process::exit(1);
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("tooldex: {e:#}");
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` wins over `--log-level`. The wrapper owns a raw-mode
/// terminal, so it only logs when a file is configured.
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_file = cli
        .log_file
        .clone()
        .or_else(|| std::env::var(LOG_ENV).ok())
        .filter(|p| !p.is_empty());
    let level = match (&cli.log_level, cli.verbose, log_file.is_some()) {
        (Some(level), _, _) => level.clone(),
        (None, true, _) => "debug".to_string(),
        (None, false, true) => "info".to_string(),
        (None, false, false) => "warn".to_string(),
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    match log_file {
        Some(path) => {
            let path = config::expand_path(Path::new(&path));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false)
                .init();
        }
        None if matches!(cli.command, Command::Wrap(_)) => {}
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Wrap(args) => commands::wrap::run(args).await,
        Command::Agent { config, args } => commands::agent::run(config.as_deref(), &args).await,
        Command::Pane {
            primary_pane,
            action,
        } => {
            let pane = resolve_primary_pane(primary_pane.as_deref())?;
            let mux = Arc::new(TmuxAdapter::new(TmuxConfig::default()));
            let mut out = std::io::stdout().lock();
            match action {
                PaneCommand::Send { text, no_enter } => {
                    commands::pane::send(mux, &pane, &text, !no_enter).await?
                }
                PaneCommand::Read {
                    lines,
                    colors,
                    json,
                } => {
                    let options = CaptureOptions {
                        lines,
                        include_colors: colors,
                    };
                    commands::pane::read(mux, &pane, options, json, &mut out).await?
                }
                PaneCommand::Watch {
                    initial_lines,
                    colors,
                    timeout,
                    max_lines,
                    poll_interval,
                    count,
                } => {
                    let subscribe = SubscribeOptions {
                        include_colors: colors,
                        initial_lines,
                    };
                    let fetch = commands::pane::fetch_options(timeout, max_lines, poll_interval)?;
                    let stop = async {
                        let _ = tokio::signal::ctrl_c().await;
                    };
                    commands::pane::watch(mux, &pane, subscribe, fetch, count, &mut out, stop)
                        .await?
                }
            }
            Ok(0)
        }
    }
}
