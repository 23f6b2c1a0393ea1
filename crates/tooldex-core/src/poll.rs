//! Bounded-wait polling for new pane output.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::capture::{CaptureTracker, Cursor, Delta};
use crate::error::{ToolError, ToolResult};
use crate::pane::PaneId;

/// Default wait for new output.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(1);
/// Default cap on lines returned by one fetch.
pub const DEFAULT_MAX_LINES: usize = 200;
/// Default spacing between re-checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Longest a single fetch may wait.
pub const MAX_FETCH_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Parameters of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// How long to wait for new output before reporting a timeout.
    pub timeout: Duration,
    /// Most lines returned; older new lines are dropped past this.
    pub max_lines: usize,
    /// Spacing between checks of the pane.
    pub poll_interval: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_lines: DEFAULT_MAX_LINES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl FetchOptions {
    /// Build from the loosely typed values a tool caller sends.
    pub fn from_secs(timeout_seconds: f64, max_lines: i64, poll_interval: f64) -> ToolResult<Self> {
        if !timeout_seconds.is_finite() || timeout_seconds < 0.0 {
            return Err(ToolError::InvalidArgument(format!(
                "timeout_seconds must be a non-negative number, got {timeout_seconds}"
            )));
        }
        if !poll_interval.is_finite() || poll_interval <= 0.0 {
            return Err(ToolError::InvalidArgument(format!(
                "poll_interval must be positive, got {poll_interval}"
            )));
        }
        let options = Self {
            timeout: seconds("timeout_seconds", timeout_seconds)?,
            max_lines: usize::try_from(max_lines).unwrap_or(0),
            poll_interval: seconds("poll_interval", poll_interval)?,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> ToolResult<()> {
        if self.timeout > MAX_FETCH_TIMEOUT {
            return Err(ToolError::InvalidArgument(format!(
                "timeout_seconds must be at most {}, got {}",
                MAX_FETCH_TIMEOUT.as_secs(),
                self.timeout.as_secs_f64()
            )));
        }
        if self.max_lines == 0 {
            return Err(ToolError::InvalidArgument(
                "max_lines must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ToolError::InvalidArgument(
                "poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn seconds(name: &str, value: f64) -> ToolResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ToolError::InvalidArgument(format!("{name} {value} is out of range: {e}")))
}

/// What a fetch delivered.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PollResult {
    pub token: String,
    pub pane: PaneId,
    /// New lines, oldest first; at most `max_lines` of them.
    pub lines: Vec<String>,
    /// How many new lines appeared, including any dropped by the cap.
    pub new_line_count: u64,
    /// Total finished lines delivered or skipped so far.
    pub lines_recorded: u64,
    pub timed_out: bool,
    pub truncated: bool,
}

/// Wait until `cursor` has new lines, the timeout passes, or `cancel` fires.
///
/// On success `cursor` is advanced past everything returned. On error it is
/// left untouched.
pub(crate) async fn wait_for_lines(
    tracker: &CaptureTracker,
    token: &str,
    pane: &PaneId,
    include_colors: bool,
    cursor: &mut Cursor,
    options: &FetchOptions,
    cancel: &mut watch::Receiver<bool>,
) -> ToolResult<PollResult> {
    options.validate()?;
    let deadline = Instant::now()
        .checked_add(options.timeout)
        .ok_or_else(|| ToolError::InvalidArgument("timeout is too far in the future".into()))?;

    loop {
        if *cancel.borrow() {
            return Err(ToolError::Cancelled);
        }

        let delta = tokio::select! {
            delta = tracker.delta(pane, cursor, options.max_lines, include_colors) => delta?,
            _ = cancelled(cancel) => return Err(ToolError::Cancelled),
        };

        match delta {
            Delta::Gap { recorded, current } => {
                return Err(ToolError::Gap {
                    token: token.to_string(),
                    recorded,
                    current,
                });
            }
            Delta::Lines {
                lines,
                new_line_count,
                truncated,
                cursor: next,
            } if !lines.is_empty() => {
                *cursor = next;
                debug!(token, lines = lines.len(), new_line_count, truncated, "fetch delivered");
                return Ok(PollResult {
                    token: token.to_string(),
                    pane: pane.clone(),
                    lines,
                    new_line_count,
                    lines_recorded: cursor.delivered,
                    timed_out: false,
                    truncated,
                });
            }
            Delta::Lines { .. } => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollResult {
                token: token.to_string(),
                pane: pane.clone(),
                lines: Vec::new(),
                new_line_count: 0,
                lines_recorded: cursor.delivered,
                timed_out: true,
                truncated: false,
            });
        }

        let nap = options.poll_interval.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = cancelled(cancel) => return Err(ToolError::Cancelled),
        }
    }
}

/// Resolves once the cancel flag is raised or its sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // `wait_for` errors when the sender is dropped, which also means
    // nobody owns this subscription any more.
    let _ = cancel.wait_for(|flag| *flag).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tool_surface() {
        let options = FetchOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(1));
        assert_eq!(options.max_lines, 200);
        assert_eq!(options.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn from_secs_validates() {
        let options = FetchOptions::from_secs(2.5, 10, 0.1).unwrap();
        assert_eq!(options.timeout, Duration::from_millis(2500));
        assert_eq!(options.max_lines, 10);

        assert!(FetchOptions::from_secs(-1.0, 10, 0.1).is_err());
        assert!(FetchOptions::from_secs(f64::NAN, 10, 0.1).is_err());
        assert!(FetchOptions::from_secs(1.0, 0, 0.1).is_err());
        assert!(FetchOptions::from_secs(1.0, -5, 0.1).is_err());
        assert!(FetchOptions::from_secs(1.0, 10, 0.0).is_err());
    }

    #[test]
    fn huge_timeouts_are_rejected() {
        let err = FetchOptions::from_secs(1e20, 10, 0.2).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument(_)));
        let err = FetchOptions::from_secs(1e19, 10, 0.2).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument(ref m) if m.contains("at most")));
        assert!(FetchOptions::from_secs(1.0, 10, 1e300).is_err());
        assert!(FetchOptions::from_secs(86_400.0, 10, 0.2).is_ok());
    }

    #[tokio::test]
    async fn oversized_timeout_fails_instead_of_waiting() {
        use crate::pane::MockMultiplexer;
        use std::sync::Arc;

        let mux = Arc::new(MockMultiplexer::new());
        let pane = mux.add_pane(24, 1000);
        let tracker = CaptureTracker::new(mux);
        let mut cursor = tracker.snapshot(&pane, 0, false).await.unwrap().cursor;
        let (_cancel_tx, mut cancel) = watch::channel(false);
        let options = FetchOptions {
            timeout: Duration::from_secs(u64::MAX),
            ..FetchOptions::default()
        };
        let err = wait_for_lines(&tracker, "t", &pane, false, &mut cursor, &options, &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument(_)));
    }

    #[test]
    fn zero_timeout_is_allowed() {
        let options = FetchOptions::from_secs(0.0, 1, 0.2).unwrap();
        assert!(options.timeout.is_zero());
    }
}
