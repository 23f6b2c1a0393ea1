//! `tooldex wrap -- CMD...`: host a program and open the agent on demand.
//!
//! The program runs in a PTY with raw passthrough. `Ctrl-]` followed by the
//! trigger key (or the marker appearing in the program's output) starts an
//! activation: this pane is locked and the agent opens in a split above.
//! When the program exits every activation is torn down first.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tooldex_core::{
    resolve_primary_pane, ActivationReport, PaneId, SplitLayout, SubscriptionManager, Supervisor,
    SupervisorConfig, TeardownReason, TmuxAdapter, TmuxConfig, ToolError, MAX_GRACE_PERIOD,
};

use crate::config::{self, AgentConfig, SearchPaths, WrapperConfig};
use crate::hotkey::{self, HotkeyDetector, MarkerWatcher, DEFAULT_MARKER};
use crate::terminal::{self as term, RawModeGuard};

/// Default agent pane command.
pub const DEFAULT_UTILITY: &str = "tooldex agent";
pub const DEFAULT_TRIGGER_KEY: char = 'u';
pub const UTILITY_ENV: &str = "UTILITY_CMD";
pub const MARKER_ENV: &str = "UTILITY_MARKER";

#[derive(Args, Debug, Clone, Default)]
pub struct WrapArgs {
    /// Command for the agent pane (default: $UTILITY_CMD, config, then `tooldex agent`)
    #[arg(short = 'u', long)]
    pub utility: Option<String>,

    /// Key pressed after Ctrl-] to open the agent pane
    #[arg(long)]
    pub trigger_key: Option<char>,

    /// Output marker that also opens the agent pane
    #[arg(long)]
    pub marker: Option<String>,

    /// Ignore the marker in the program's output
    #[arg(long)]
    pub no_marker_watch: bool,

    /// Do not add a `tool` command when wrapping gdb
    #[arg(long)]
    pub no_gdb_inject: bool,

    /// Pane to lock (default: $TOOLDEX_PRIMARY_PANE, then $TMUX_PANE)
    #[arg(long)]
    pub primary_pane: Option<String>,

    /// Config file path
    #[arg(short = 'c', long)]
    pub config: Option<String>,

    /// Program and arguments (default: your login shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Effective wrapper settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WrapOptions {
    pub command: Vec<String>,
    pub utility: String,
    pub trigger_key: char,
    pub marker: String,
    pub marker_watch: bool,
    pub gdb_inject: bool,
    pub primary_pane: Option<String>,
    pub layout: SplitLayout,
    pub grace_period: Duration,
}

impl WrapOptions {
    /// Flags win over the environment, which wins over `[tooldex.wrapper]`.
    pub fn resolve(
        args: WrapArgs,
        wrapper: &WrapperConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut command = args.command;
        if command.first().map(String::as_str) == Some("--") {
            command.remove(0);
        }
        let defaults = SupervisorConfig::default();
        Self {
            command,
            utility: args
                .utility
                .or_else(|| env(UTILITY_ENV))
                .or_else(|| wrapper.utility.clone())
                .unwrap_or_else(|| DEFAULT_UTILITY.to_string()),
            trigger_key: args
                .trigger_key
                .or(wrapper.trigger_key)
                .unwrap_or(DEFAULT_TRIGGER_KEY),
            marker: args
                .marker
                .or_else(|| env(MARKER_ENV))
                .or_else(|| wrapper.marker.clone())
                .unwrap_or_else(|| DEFAULT_MARKER.to_string()),
            marker_watch: !args.no_marker_watch,
            gdb_inject: !args.no_gdb_inject,
            primary_pane: args.primary_pane,
            layout: wrapper.split.clone().unwrap_or(defaults.layout),
            grace_period: wrapper
                .grace_period_secs
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .map(|grace| grace.min(MAX_GRACE_PERIOD))
                .unwrap_or(defaults.grace_period),
        }
    }
}

/// Supervisor bound to the pane this wrapper runs in.
struct Session {
    supervisor: Supervisor,
    primary: PaneId,
}

impl Session {
    /// `None` outside tmux: there is no pane to lock or split.
    fn detect(options: &WrapOptions) -> Result<Option<Self>> {
        if std::env::var_os("TMUX").is_none() && options.primary_pane.is_none() {
            return Ok(None);
        }
        let primary = resolve_primary_pane(options.primary_pane.as_deref())?;
        let mux = Arc::new(TmuxAdapter::new(TmuxConfig::default()));
        let subscriptions = Arc::new(SubscriptionManager::new(mux.clone()));
        let config = SupervisorConfig {
            agent_command: options.utility.clone(),
            layout: options.layout.clone(),
            grace_period: options.grace_period,
            ..SupervisorConfig::default()
        };
        Ok(Some(Self {
            supervisor: Supervisor::new(mux, subscriptions, config),
            primary,
        }))
    }
}

pub async fn run(args: WrapArgs) -> Result<i32> {
    let source = config::resolve_config_path(args.config.as_deref(), &SearchPaths::from_env())?;
    let agent_config = AgentConfig::load(&source)?;
    let options = WrapOptions::resolve(args, &agent_config.wrapper, |k| std::env::var(k).ok());
    debug!(?options, config = %source, "wrapper options");

    let shell = std::env::var("SHELL").ok();
    let argv = hotkey::child_argv(
        &options.command,
        shell.as_deref(),
        options.gdb_inject,
        &options.marker,
    );
    let session = Session::detect(&options)?;

    let (cols, rows) = term::get_terminal_size();
    let pair = native_pty_system()
        .openpty(pty_size(cols, rows))
        .map_err(|e| anyhow!("failed to open PTY: {e}"))?;
    let mut cmd = CommandBuilder::new(&argv[0]);
    cmd.args(&argv[1..]);
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow!("failed to start '{}': {e}", argv[0]))?;
    drop(pair.slave);
    info!(argv = %config::shell_join(&argv), cols, rows, "child started");

    let master = pair.master;
    let reader = master
        .try_clone_reader()
        .map_err(|e| anyhow!("failed to clone PTY reader: {e}"))?;
    let writer = master
        .take_writer()
        .map_err(|e| anyhow!("failed to take PTY writer: {e}"))?;

    let (report_tx, report_rx) = mpsc::unbounded_channel::<ActivationReport>();
    let mut relay = Relay {
        writer,
        from_user: spawn_reader(Box::new(std::io::stdin())),
        from_child: spawn_reader(reader),
        winch: signal(SignalKind::window_change()).context("failed to watch SIGWINCH")?,
        keys: HotkeyDetector::new(options.trigger_key),
        marker: options
            .marker_watch
            .then(|| MarkerWatcher::new(&options.marker)),
        report_tx,
        report_rx,
    };

    let raw = RawModeGuard::enter()?;
    let hint = if hotkey::is_gdb(&argv) && options.gdb_inject {
        format!(
            "Hotkey: Ctrl-] then '{}'  |  gdb cmd: 'tool'",
            options.trigger_key
        )
    } else {
        format!("Hotkey: Ctrl-] then '{}'", options.trigger_key)
    };
    term::notice(&format!("{hint}  -> opens the agent pane."));
    if session.is_none() {
        term::notice("Not in tmux; the agent pane is unavailable.");
    }

    let outcome = relay.pump(session.as_ref(), &*master).await;
    let outcome = finish(session.as_ref(), outcome).await;

    drop(relay);
    if !matches!(outcome, Ok(Ending::ChildClosed)) {
        debug!("stopping child");
        let _ = child.kill();
    }
    let status = tokio::task::spawn_blocking(move || child.wait())
        .await
        .context("child wait task failed")?
        .context("failed to wait for child")?;
    drop(raw);
    outcome?;

    let code = status.exit_code() as i32;
    info!(code, "child exited");
    Ok(code)
}

/// Which side of the relay closed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    ChildClosed,
    UserClosed,
}

/// Byte streams between the user's terminal and the child's PTY.
struct Relay {
    writer: Box<dyn Write + Send>,
    from_user: mpsc::Receiver<Vec<u8>>,
    from_child: mpsc::Receiver<Vec<u8>>,
    winch: Signal,
    keys: HotkeyDetector,
    marker: Option<MarkerWatcher>,
    report_tx: mpsc::UnboundedSender<ActivationReport>,
    report_rx: mpsc::UnboundedReceiver<ActivationReport>,
}

impl Relay {
    /// Pass bytes both ways until either side closes, opening the agent
    /// pane on each trigger. A failed write ends the relay with its error.
    async fn pump(&mut self, session: Option<&Session>, master: &dyn MasterPty) -> Result<Ending> {
        let mut stdout = std::io::stdout();
        loop {
            tokio::select! {
                chunk = self.from_user.recv() => {
                    let Some(bytes) = chunk else { return Ok(Ending::UserClosed) };
                    let scan = self.keys.feed(&bytes);
                    if !scan.passthrough.is_empty() {
                        self.writer.write_all(&scan.passthrough).context("failed to write to PTY")?;
                        self.writer.flush().context("failed to flush PTY")?;
                    }
                    for _ in 0..scan.triggers {
                        trigger(session, &self.report_tx).await;
                    }
                }
                chunk = self.from_child.recv() => {
                    let Some(bytes) = chunk else { return Ok(Ending::ChildClosed) };
                    stdout.write_all(&bytes).context("failed to write to stdout")?;
                    stdout.flush().context("failed to flush stdout")?;
                    if self.marker.as_mut().is_some_and(|m| m.feed(&bytes) > 0) {
                        trigger(session, &self.report_tx).await;
                    }
                }
                Some(()) = self.winch.recv() => {
                    let (cols, rows) = term::get_terminal_size();
                    if let Err(e) = master.resize(pty_size(cols, rows)) {
                        warn!(error = %e, "PTY resize failed");
                    }
                }
                Some(report) = self.report_rx.recv() => announce(&report),
            }
        }
    }
}

/// Tear down every activation however the relay ended, then hand back its
/// outcome.
async fn finish(session: Option<&Session>, outcome: Result<Ending>) -> Result<Ending> {
    if let Err(e) = &outcome {
        warn!(error = %format!("{e:#}"), "relay failed, tearing down");
    }
    if let Some(session) = session {
        for report in session.supervisor.shutdown().await {
            announce(&report);
        }
    }
    outcome
}

async fn trigger(session: Option<&Session>, reports: &mpsc::UnboundedSender<ActivationReport>) {
    let Some(session) = session else {
        term::notice("Not in tmux; cannot open the agent pane.");
        return;
    };
    match session.supervisor.activate(&session.primary).await {
        Ok(handle) => {
            term::notice(&format!(
                "Agent opened in pane {}; this pane is read-only until it exits.",
                handle.agent_pane
            ));
            let reports = reports.clone();
            tokio::spawn(async move {
                let _ = reports.send(handle.wait().await);
            });
        }
        Err(ToolError::ActivationInProgress(_)) => {
            term::notice("An agent is already running for this pane.");
        }
        Err(e) => term::notice(&format!("Could not open the agent pane: {e}")),
    }
}

fn announce(report: &ActivationReport) {
    term::notice(&describe(report));
    for error in &report.errors {
        term::notice(&format!("cleanup: {error}"));
    }
}

/// One-line summary of how an activation ended.
pub fn describe(report: &ActivationReport) -> String {
    let why = match report.reason {
        TeardownReason::AgentExited => "agent exited",
        TeardownReason::Cancelled => "cancelled",
        TeardownReason::PrimaryGone => "this pane went away",
        TeardownReason::MultiplexerLost => "lost contact with tmux",
    };
    match (report.agent_failure(), report.exit_status) {
        (Some(failure), _) => format!("Agent pane closed: {failure}."),
        (None, Some(status)) => format!("Agent pane closed ({why}, status {status})."),
        (None, None) => format!("Agent pane closed ({why})."),
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Pump a blocking reader into a channel from a dedicated thread. The
/// channel closes on EOF or a read error.
fn spawn_reader(mut reader: Box<dyn Read + Send>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tooldex_core::{ActivationId, MockMultiplexer, SessionState, SplitDirection};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_config() {
        let options = WrapOptions::resolve(WrapArgs::default(), &WrapperConfig::default(), no_env);
        assert_eq!(options.utility, DEFAULT_UTILITY);
        assert_eq!(options.trigger_key, 'u');
        assert_eq!(options.marker, DEFAULT_MARKER);
        assert!(options.marker_watch);
        assert!(options.gdb_inject);
        assert_eq!(options.grace_period, Duration::from_secs(3));
        assert!(options.command.is_empty());
    }

    #[test]
    fn flags_beat_env_beat_config() {
        let wrapper = WrapperConfig {
            utility: Some("from-config".into()),
            trigger_key: Some('t'),
            marker: Some("CFG".into()),
            grace_period_secs: Some(0.5),
            split: Some(SplitLayout {
                direction: SplitDirection::Horizontal,
                before: false,
                size: None,
            }),
        };
        let env = |key: &str| match key {
            UTILITY_ENV => Some("from-env".to_string()),
            _ => None,
        };

        let options = WrapOptions::resolve(WrapArgs::default(), &wrapper, env);
        assert_eq!(options.utility, "from-env");
        assert_eq!(options.marker, "CFG");
        assert_eq!(options.trigger_key, 't');
        assert_eq!(options.grace_period, Duration::from_millis(500));
        assert_eq!(options.layout.direction, SplitDirection::Horizontal);

        let args = WrapArgs {
            utility: Some("from-flag".into()),
            trigger_key: Some('x'),
            no_marker_watch: true,
            command: vec!["--".into(), "gdb".into()],
            ..WrapArgs::default()
        };
        let options = WrapOptions::resolve(args, &wrapper, env);
        assert_eq!(options.utility, "from-flag");
        assert_eq!(options.trigger_key, 'x');
        assert!(!options.marker_watch);
        assert_eq!(options.command, vec!["gdb"]);
    }

    #[test]
    fn unusable_grace_periods_fall_back_or_clamp() {
        let resolve = |secs: f64| {
            let wrapper = WrapperConfig {
                grace_period_secs: Some(secs),
                ..WrapperConfig::default()
            };
            WrapOptions::resolve(WrapArgs::default(), &wrapper, no_env).grace_period
        };
        assert_eq!(resolve(1e30), MAX_GRACE_PERIOD);
        assert_eq!(resolve(f64::INFINITY), Duration::from_secs(3));
        assert_eq!(resolve(f64::NAN), Duration::from_secs(3));
        assert_eq!(resolve(-1.0), Duration::from_secs(3));
        assert_eq!(resolve(0.0), Duration::ZERO);
    }

    fn mock_session() -> (Arc<MockMultiplexer>, Session) {
        let mux = Arc::new(MockMultiplexer::new());
        let primary = mux.add_pane(24, 1000);
        let subscriptions = Arc::new(SubscriptionManager::new(mux.clone()));
        let config = SupervisorConfig {
            exit_poll_interval: Duration::from_millis(10),
            ..SupervisorConfig::default()
        };
        let session = Session {
            supervisor: Supervisor::new(mux.clone(), subscriptions, config),
            primary,
        };
        (mux, session)
    }

    #[tokio::test]
    async fn failed_relay_still_tears_down_activations() {
        let (mux, session) = mock_session();
        let handle = session.supervisor.activate(&session.primary).await.unwrap();
        assert_eq!(mux.input_enabled(&session.primary), Some(false));

        let outcome = finish(Some(&session), Err(anyhow!("failed to write to PTY"))).await;
        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("failed to write to PTY"));
        assert_eq!(
            session.supervisor.state(&session.primary).await,
            SessionState::Idle
        );
        assert_eq!(mux.input_enabled(&session.primary), Some(true));
        assert!(!mux.pane_exists(&handle.agent_pane));
    }

    #[tokio::test]
    async fn finish_passes_clean_endings_through() {
        let (_mux, session) = mock_session();
        let outcome = finish(Some(&session), Ok(Ending::UserClosed)).await;
        assert_eq!(outcome.unwrap(), Ending::UserClosed);
        let outcome = finish(None, Ok(Ending::ChildClosed)).await;
        assert_eq!(outcome.unwrap(), Ending::ChildClosed);
    }

    fn report(reason: TeardownReason, exit_status: Option<i32>) -> ActivationReport {
        ActivationReport {
            id: ActivationId(1),
            primary: PaneId::new("%0"),
            agent_pane: PaneId::new("%1"),
            reason,
            exit_status,
            released_subscriptions: 0,
            errors: Vec::new(),
        }
    }

    #[test]
    fn describes_endings() {
        assert_eq!(
            describe(&report(TeardownReason::AgentExited, Some(0))),
            "Agent pane closed (agent exited, status 0)."
        );
        assert_eq!(
            describe(&report(TeardownReason::AgentExited, Some(2))),
            "Agent pane closed: agent process failed with status 2."
        );
        assert_eq!(
            describe(&report(TeardownReason::PrimaryGone, None)),
            "Agent pane closed (this pane went away)."
        );
    }
}
