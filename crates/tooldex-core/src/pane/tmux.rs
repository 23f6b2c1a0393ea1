//! tmux implementation of [`Multiplexer`].
//!
//! Every primitive is one `tmux` invocation (several commands may be chained
//! with `;` so they execute back to back on the server). Invocations are
//! bounded by a timeout; timeouts and unexplained failures are retried a few
//! times before surfacing as [`ToolError::MultiplexerUnavailable`].

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{LineSpan, Multiplexer, PaneExtent, PaneId, PaneState, SplitDirection, SplitRequest};
use crate::error::{ToolError, ToolResult};

/// Adapter settings.
#[derive(Debug, Clone)]
pub struct TmuxConfig {
    /// tmux executable.
    pub binary: String,
    /// Optional `-L` socket name.
    pub socket: Option<String>,
    /// Upper bound for a single tmux invocation.
    pub command_timeout: Duration,
    /// Extra attempts for transient failures.
    pub retries: u32,
    /// Pause between attempts.
    pub retry_backoff: Duration,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            socket: None,
            command_timeout: Duration::from_secs(5),
            retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Drives a tmux server through its command line.
#[derive(Debug, Clone, Default)]
pub struct TmuxAdapter {
    config: TmuxConfig,
}

impl TmuxAdapter {
    pub fn new(config: TmuxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TmuxConfig {
        &self.config
    }

    /// Run a tmux command line, retrying transient failures.
    async fn run(&self, args: Vec<String>) -> ToolResult<String> {
        let mut attempt = 0;
        loop {
            match self.run_once(&args).await {
                Err(e) if e.is_transient() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "retrying tmux command");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(ToolError::Transient(msg)) => {
                    return Err(ToolError::MultiplexerUnavailable(msg));
                }
                other => return other,
            }
        }
    }

    async fn run_once(&self, args: &[String]) -> ToolResult<String> {
        let mut cmd = Command::new(&self.config.binary);
        if let Some(ref socket) = self.config.socket {
            cmd.arg("-L").arg(socket);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(args = ?args, "tmux");

        let output = match tokio::time::timeout(self.config.command_timeout, cmd.output()).await
        {
            Err(_) => {
                return Err(ToolError::Transient(format!(
                    "tmux {} timed out after {:?}",
                    args.first().map(String::as_str).unwrap_or(""),
                    self.config.command_timeout
                )));
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::MultiplexerUnavailable(format!(
                    "'{}' not found on PATH",
                    self.config.binary
                )));
            }
            Ok(Err(e)) => return Err(ToolError::Io(e)),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn display(&self, pane: &PaneId, format: &str) -> ToolResult<String> {
        let out = self
            .run(args(["display-message", "-p", "-t", pane.as_str(), format]))
            .await?;
        Ok(out.trim_end_matches('\n').to_string())
    }

    async fn input_locked(&self, pane: &PaneId) -> ToolResult<bool> {
        Ok(self.display(pane, "#{pane_input_off}").await?.trim() == "1")
    }
}

#[async_trait]
impl Multiplexer for TmuxAdapter {
    async fn send(&self, pane: &PaneId, text: &str, press_enter: bool) -> ToolResult<()> {
        let locked = self.input_locked(pane).await?;
        let target = pane.as_str();

        // A locked pane rejects send-keys too, so lift the lock for exactly
        // this command list and put it back before tmux handles other input.
        let mut cmd = Vec::new();
        if locked {
            cmd.extend(args(["select-pane", "-e", "-t", target, ";"]));
        }
        cmd.extend(args(["send-keys", "-t", target, "-l", "--"]));
        cmd.push(escape_trailing_semicolon(text));
        if press_enter {
            cmd.extend(args([";", "send-keys", "-t", target, "Enter"]));
        }
        if locked {
            cmd.extend(args([";", "select-pane", "-d", "-t", target]));
        }

        self.run(cmd).await?;
        debug!(pane = %pane, press_enter, locked, "sent text");
        Ok(())
    }

    async fn send_keys(&self, pane: &PaneId, keys: &[&str]) -> ToolResult<()> {
        let mut cmd = args(["send-keys", "-t", pane.as_str()]);
        cmd.extend(keys.iter().map(|k| k.to_string()));
        self.run(cmd).await?;
        Ok(())
    }

    async fn capture(
        &self,
        pane: &PaneId,
        span: LineSpan,
        include_colors: bool,
    ) -> ToolResult<Vec<String>> {
        if span.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = args(["capture-pane", "-p", "-t", pane.as_str()]);
        cmd.extend(["-S".to_string(), span.start.to_string()]);
        cmd.extend(["-E".to_string(), span.end.to_string()]);
        if include_colors {
            cmd.push("-e".to_string());
        }
        let out = self.run(cmd).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn extent(&self, pane: &PaneId) -> ToolResult<PaneExtent> {
        let out = self
            .display(
                pane,
                "#{history_size} #{history_limit} #{cursor_y} #{pane_height}",
            )
            .await?;
        parse_extent(&out)
    }

    async fn list_panes(&self) -> ToolResult<Vec<PaneId>> {
        let out = self
            .run(args(["list-panes", "-a", "-F", "#{pane_id}"]))
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PaneId::new)
            .collect())
    }

    async fn split(&self, request: &SplitRequest<'_>) -> ToolResult<PaneId> {
        let mut cmd = args(["split-window", "-P", "-F", "#{pane_id}"]);
        cmd.push(
            match request.layout.direction {
                SplitDirection::Vertical => "-v",
                SplitDirection::Horizontal => "-h",
            }
            .to_string(),
        );
        if request.layout.before {
            cmd.push("-b".to_string());
        }
        if let Some(ref size) = request.layout.size {
            cmd.extend(["-l".to_string(), size.clone()]);
        }
        cmd.extend(["-t".to_string(), request.target.to_string()]);
        for (key, value) in request.env {
            cmd.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        cmd.push(request.command.to_string());

        let out = self.run(cmd).await?;
        let pane = out.trim();
        if pane.is_empty() {
            return Err(ToolError::Other(
                "tmux split-window did not report a pane id".into(),
            ));
        }
        let pane = PaneId::new(pane);

        // Keep the pane around after its process exits so the exit status
        // can be read back. The agent may already be gone; that is fine.
        match self
            .run(args([
                "set-option",
                "-p",
                "-t",
                pane.as_str(),
                "remain-on-exit",
                "on",
            ]))
            .await
        {
            Ok(_) | Err(ToolError::PaneNotFound(_)) => {}
            Err(e) => warn!(pane = %pane, error = %e, "could not set remain-on-exit"),
        }

        info!(target = %request.target, pane = %pane, "split pane");
        Ok(pane)
    }

    async fn pane_state(&self, pane: &PaneId) -> ToolResult<PaneState> {
        let out = self
            .display(pane, "#{pane_dead} #{pane_dead_status} #{pane_pid}")
            .await?;
        Ok(parse_pane_state(&out))
    }

    async fn set_input_enabled(&self, pane: &PaneId, enabled: bool) -> ToolResult<()> {
        let flag = if enabled { "-e" } else { "-d" };
        self.run(args(["select-pane", flag, "-t", pane.as_str()]))
            .await?;
        debug!(pane = %pane, enabled, "pane input toggled");
        Ok(())
    }

    async fn terminate(&self, pane: &PaneId) -> ToolResult<()> {
        let pid = match self.pane_state(pane).await? {
            PaneState::Alive { pid: Some(pid) } => pid,
            PaneState::Alive { pid: None } | PaneState::Exited { .. } => return Ok(()),
        };
        let status = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            debug!(pane = %pane, pid, "process already gone when signalled");
        }
        Ok(())
    }

    async fn kill(&self, pane: &PaneId) -> ToolResult<()> {
        match self.run(args(["kill-pane", "-t", pane.as_str()])).await {
            Ok(_) | Err(ToolError::PaneNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Map tmux's stderr to an error kind.
fn classify_failure(stderr: &str) -> ToolError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("can't find pane")
        || lower.contains("can't find window")
        || lower.contains("can't find session")
    {
        ToolError::PaneNotFound(message)
    } else if lower.contains("no server running") || lower.contains("error connecting to") {
        ToolError::MultiplexerUnavailable(message)
    } else {
        ToolError::Transient(message)
    }
}

/// tmux treats an argument ending in `;` as a command separator; a
/// backslash before the final `;` makes it literal.
fn escape_trailing_semicolon(text: &str) -> String {
    match text.strip_suffix(';') {
        Some(head) => format!("{head}\\;"),
        None => text.to_string(),
    }
}

fn parse_extent(out: &str) -> ToolResult<PaneExtent> {
    let fields: Vec<u64> = out
        .split_whitespace()
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|e| ToolError::Other(format!("unexpected pane extent '{out}': {e}")))?;
    match fields.as_slice() {
        [history_size, history_limit, cursor_y, height] => Ok(PaneExtent {
            history_size: *history_size,
            history_limit: *history_limit,
            cursor_y: *cursor_y,
            height: *height,
        }),
        _ => Err(ToolError::Other(format!("unexpected pane extent '{out}'"))),
    }
}

fn parse_pane_state(out: &str) -> PaneState {
    let mut fields = out.split_whitespace();
    let dead = fields.next() == Some("1");
    if dead {
        // `pane_dead_status` is empty when the process died from a signal,
        // so the next field may already be the pid.
        let status = out
            .split(' ')
            .nth(1)
            .and_then(|s| s.trim().parse::<i32>().ok());
        PaneState::Exited { status }
    } else {
        let pid = out
            .split(' ')
            .nth(2)
            .and_then(|s| s.trim().parse::<u32>().ok());
        PaneState::Alive { pid }
    }
}
