//! Pane control: the multiplexer primitives everything else is built on.
//!
//! The [`Multiplexer`] trait is the only way the rest of the crate touches
//! a terminal. [`TmuxAdapter`] drives a real tmux server; [`MockMultiplexer`]
//! keeps panes in memory for tests and dry runs.

pub mod mock;
pub mod tmux;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ToolError, ToolResult};

pub use mock::MockMultiplexer;
pub use tmux::{TmuxAdapter, TmuxConfig};

/// Environment variable carrying an explicit primary pane override.
pub const PRIMARY_PANE_ENV: &str = "TOOLDEX_PRIMARY_PANE";

/// Environment variable tmux sets to the pane a process is attached to.
pub const TMUX_PANE_ENV: &str = "TMUX_PANE";

/// Opaque multiplexer pane identifier (tmux uses `%<n>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaneId(String);

impl PaneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PaneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Geometry of a pane's line history at one instant.
///
/// Rows are numbered the way tmux numbers them: `0` is the top visible row,
/// negative numbers reach back into the scrollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaneExtent {
    /// Lines currently retained above the visible screen.
    pub history_size: u64,
    /// Maximum scrollback the multiplexer keeps for this pane.
    pub history_limit: u64,
    /// Row of the cursor within the visible screen.
    pub cursor_y: u64,
    /// Visible height in rows.
    pub height: u64,
}

impl PaneExtent {
    /// Number of finished lines: everything strictly above the cursor row.
    pub fn completed(&self) -> u64 {
        self.history_size + self.cursor_y
    }

    /// Convert an absolute line index (0 = oldest retained line) to a row number.
    pub fn row_of(&self, index: u64) -> i64 {
        index as i64 - self.history_size as i64
    }

    /// Whether older lines may have been discarded. tmux drops a tenth of
    /// the limit each time history fills, so once full it never falls back
    /// below that mark.
    pub fn history_saturated(&self) -> bool {
        let trim = (self.history_limit / 10).max(1);
        self.history_limit > 0 && self.history_size + trim >= self.history_limit
    }
}

/// Inclusive row range for a capture, in multiplexer row numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    pub start: i64,
    pub end: i64,
}

impl LineSpan {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Liveness of the process running inside a pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    Alive { pid: Option<u32> },
    Exited { status: Option<i32> },
}

/// Orientation of a new pane relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SplitDirection {
    /// Stack panes top/bottom.
    #[default]
    Vertical,
    /// Place panes side by side.
    Horizontal,
}

/// Where and how big the agent pane should be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitLayout {
    #[serde(default)]
    pub direction: SplitDirection,
    /// Put the new pane above/left of the target instead of below/right.
    #[serde(default = "default_before")]
    pub before: bool,
    /// Size passed through to the multiplexer (`"40%"`, `"20"`).
    #[serde(default)]
    pub size: Option<String>,
}

fn default_before() -> bool {
    true
}

impl Default for SplitLayout {
    fn default() -> Self {
        Self {
            direction: SplitDirection::Vertical,
            before: default_before(),
            size: None,
        }
    }
}

/// Everything needed to open a new pane running a command.
#[derive(Debug, Clone)]
pub struct SplitRequest<'a> {
    pub target: &'a PaneId,
    pub layout: &'a SplitLayout,
    pub command: &'a str,
    pub env: &'a [(String, String)],
}

/// The multiplexer control surface.
///
/// Calls are independent round trips to the multiplexer; implementations
/// bound each one with a timeout so a wedged server cannot hang callers.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Type `text` into the pane, pressing Enter afterwards when asked.
    async fn send(&self, pane: &PaneId, text: &str, press_enter: bool) -> ToolResult<()>;

    /// Send named keys (`C-c`, `Escape`) without any text translation.
    async fn send_keys(&self, pane: &PaneId, keys: &[&str]) -> ToolResult<()>;

    /// Capture the rows of `span`, oldest first.
    async fn capture(
        &self,
        pane: &PaneId,
        span: LineSpan,
        include_colors: bool,
    ) -> ToolResult<Vec<String>>;

    /// Current history geometry of the pane.
    async fn extent(&self, pane: &PaneId) -> ToolResult<PaneExtent>;

    /// Every pane the multiplexer knows about.
    async fn list_panes(&self) -> ToolResult<Vec<PaneId>>;

    /// Open a new pane next to `request.target` running `request.command`.
    async fn split(&self, request: &SplitRequest<'_>) -> ToolResult<PaneId>;

    /// Whether the pane's process is still running.
    async fn pane_state(&self, pane: &PaneId) -> ToolResult<PaneState>;

    /// Enable or disable direct keyboard input to the pane.
    async fn set_input_enabled(&self, pane: &PaneId, enabled: bool) -> ToolResult<()>;

    /// Ask the pane's process to exit (SIGTERM).
    async fn terminate(&self, pane: &PaneId) -> ToolResult<()>;

    /// Destroy the pane. Killing a pane that is already gone succeeds.
    async fn kill(&self, pane: &PaneId) -> ToolResult<()>;
}

/// Resolve the primary pane from an explicit value or the process environment.
pub fn resolve_primary_pane(explicit: Option<&str>) -> ToolResult<PaneId> {
    resolve_primary_pane_with(explicit, |key| std::env::var(key).ok())
}

/// Like [`resolve_primary_pane`] with a pluggable environment lookup.
pub fn resolve_primary_pane_with<F>(explicit: Option<&str>, lookup: F) -> ToolResult<PaneId>
where
    F: Fn(&str) -> Option<String>,
{
    let candidate = explicit
        .map(str::to_string)
        .or_else(|| lookup(PRIMARY_PANE_ENV))
        .or_else(|| lookup(TMUX_PANE_ENV))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    candidate.map(PaneId::new).ok_or_else(|| {
        ToolError::PaneNotFound(format!(
            "primary pane is unknown; set {PRIMARY_PANE_ENV} or run inside tmux"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_lines_exclude_cursor_row() {
        let extent = PaneExtent {
            history_size: 10,
            history_limit: 2000,
            cursor_y: 3,
            height: 24,
        };
        assert_eq!(extent.completed(), 13);
        assert_eq!(extent.row_of(10), 0);
        assert_eq!(extent.row_of(4), -6);
        assert!(!extent.history_saturated());
    }

    #[test]
    fn saturation_needs_a_limit() {
        let extent = PaneExtent {
            history_size: 50,
            history_limit: 50,
            cursor_y: 0,
            height: 10,
        };
        assert!(extent.history_saturated());
        let unlimited = PaneExtent {
            history_limit: 0,
            ..extent
        };
        assert!(!unlimited.history_saturated());

        let trimmed = PaneExtent {
            history_size: 1800,
            history_limit: 2000,
            ..extent
        };
        assert!(trimmed.history_saturated());
        let filling = PaneExtent {
            history_size: 1799,
            ..trimmed
        };
        assert!(!filling.history_saturated());
    }

    #[test]
    fn explicit_pane_wins() {
        let pane = resolve_primary_pane_with(Some("%7"), |_| Some("%1".into())).unwrap();
        assert_eq!(pane.as_str(), "%7");
    }

    #[test]
    fn override_env_beats_tmux_pane() {
        let pane = resolve_primary_pane_with(None, |key| match key {
            PRIMARY_PANE_ENV => Some("%3".into()),
            TMUX_PANE_ENV => Some("%9".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(pane.as_str(), "%3");
    }

    #[test]
    fn falls_back_to_tmux_pane() {
        let pane = resolve_primary_pane_with(None, |key| {
            (key == TMUX_PANE_ENV).then(|| "%2".to_string())
        })
        .unwrap();
        assert_eq!(pane.as_str(), "%2");
    }

    #[test]
    fn unresolvable_pane_is_an_error() {
        let err = resolve_primary_pane_with(None, |_| None).unwrap_err();
        assert!(matches!(err, ToolError::PaneNotFound(_)));
        let err = resolve_primary_pane_with(Some("  "), |_| None).unwrap_err();
        assert!(matches!(err, ToolError::PaneNotFound(_)));
    }

    #[test]
    fn split_layout_defaults_to_top_pane() {
        let layout: SplitLayout = serde_json::from_str("{}").unwrap();
        assert_eq!(layout, SplitLayout::default());
        assert!(layout.before);
        assert_eq!(layout.direction, SplitDirection::Vertical);
    }
}
