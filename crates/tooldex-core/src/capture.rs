//! Incremental capture: "which lines are new since I last looked?"
//!
//! Lines are addressed by absolute index, 0 being the oldest line the
//! multiplexer still retains. Only finished lines (above the cursor row) are
//! ever delivered, so a half-typed prompt is never split across two reads.
//!
//! While history is below its limit the line count is trusted and the
//! reader's last few lines are checked in place. Once history is full, old
//! lines scroll off without changing the count, so the reader's last lines
//! are searched for instead and the shift is derived from where they are
//! found. A position that cannot be pinned down exactly is a [`Delta::Gap`].

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ToolError, ToolResult};
use crate::pane::{LineSpan, Multiplexer, PaneExtent, PaneId};

/// How many times a read is retried while the pane keeps scrolling.
const STABLE_READ_ATTEMPTS: usize = 3;

/// Lines remembered from the end of what a reader has seen.
pub const TAIL_LINES: usize = 8;

/// Default number of lines for a one-shot read.
pub const DEFAULT_READ_LINES: usize = 200;

/// Parameters of a one-shot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub lines: usize,
    pub include_colors: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            lines: DEFAULT_READ_LINES,
            include_colors: false,
        }
    }
}

/// Delivery position of one reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Absolute index of the first line not yet seen.
    pub recorded: u64,
    /// Lines seen since the baseline was taken, baseline included. Never
    /// decreases, even when history is trimmed under the reader.
    pub delivered: u64,
    /// Up to [`TAIL_LINES`] lines ending at `recorded`, oldest first.
    pub tail: Vec<String>,
}

/// Outcome of an incremental read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// New lines (possibly none). `lines` holds at most `max_lines` of the
    /// most recent ones; `new_line_count` is how many actually appeared.
    Lines {
        lines: Vec<String>,
        new_line_count: u64,
        truncated: bool,
        cursor: Cursor,
    },
    /// The reader's position can no longer be found in the pane.
    Gap { recorded: u64, current: u64 },
}

/// Baseline taken when a reader starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub lines: Vec<String>,
    pub truncated: bool,
    pub cursor: Cursor,
}

/// One-shot capture of the most recent lines, cursor row included.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PaneRead {
    pub pane: PaneId,
    pub lines_requested: usize,
    pub lines_returned: usize,
    pub truncated: bool,
    pub include_colors: bool,
    pub content: Vec<String>,
}

/// Computes deltas against a multiplexer.
#[derive(Clone)]
pub struct CaptureTracker {
    mux: Arc<dyn Multiplexer>,
}

impl CaptureTracker {
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self { mux }
    }

    pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.mux
    }

    /// Lines finished since `cursor`, capped at `max_lines`.
    pub async fn delta(
        &self,
        pane: &PaneId,
        cursor: &Cursor,
        max_lines: usize,
        include_colors: bool,
    ) -> ToolResult<Delta> {
        if max_lines == 0 {
            return Err(ToolError::InvalidArgument("max_lines must be at least 1".into()));
        }

        for attempt in 0..STABLE_READ_ATTEMPTS {
            let before = self.mux.extent(pane).await?;
            let total = before.completed();
            let read = if before.history_saturated() || total < cursor.recorded {
                self.relocate(pane, &before, cursor, max_lines, include_colors)
                    .await?
            } else {
                self.advance(pane, &before, cursor, max_lines, include_colors)
                    .await?
            };

            let after = self.mux.extent(pane).await?;
            match read {
                Some(delta) if after.history_size == before.history_size => return Ok(delta),
                _ => debug!(pane = %pane, attempt, "pane scrolled during capture, retrying"),
            }
        }

        // Output is streaming faster than we can pin it down; report nothing
        // new and let the caller look again on its next tick.
        Ok(Delta::Lines {
            lines: Vec::new(),
            new_line_count: 0,
            truncated: false,
            cursor: cursor.clone(),
        })
    }

    /// History is below its limit, so line indices are stable: check the
    /// tail where it should be and take everything after it. `None` when the
    /// capture came back short.
    async fn advance(
        &self,
        pane: &PaneId,
        extent: &PaneExtent,
        cursor: &Cursor,
        max_lines: usize,
        include_colors: bool,
    ) -> ToolResult<Option<Delta>> {
        let total = extent.completed();
        let seen = cursor.recorded;
        let check_from = seen.saturating_sub(cursor.tail.len() as u64);
        let new_line_count = total - seen;
        let first = total - new_line_count.min(max_lines as u64);
        let keep_from = first.min(total.saturating_sub(TAIL_LINES as u64));

        // One capture when the tail and the new lines are adjacent, two when
        // truncation leaves a hole between them.
        let truncated = new_line_count > max_lines as u64;
        let start = if truncated { keep_from } else { keep_from.min(check_from) };
        let rows = self
            .capture_indices(pane, extent, start, total, include_colors)
            .await?;
        if rows.len() as u64 != total - start {
            return Ok(None);
        }
        let checked = if check_from >= start {
            rows[(check_from - start) as usize..(seen - start) as usize].to_vec()
        } else {
            self.capture_indices(pane, extent, check_from, seen, include_colors)
                .await?
        };

        if checked != cursor.tail {
            debug!(pane = %pane, recorded = seen, "history rewritten under reader");
            return Ok(Some(Delta::Gap {
                recorded: seen,
                current: total,
            }));
        }
        Ok(Some(deliver(rows, start, seen, total, max_lines, cursor)))
    }

    /// History may be scrolling off at constant length: find the reader's
    /// tail in what is retained. A missing or repeated match is a gap.
    async fn relocate(
        &self,
        pane: &PaneId,
        extent: &PaneExtent,
        cursor: &Cursor,
        max_lines: usize,
        include_colors: bool,
    ) -> ToolResult<Option<Delta>> {
        let total = extent.completed();
        // Retained history is bounded by the history limit.
        let rows = self
            .capture_indices(pane, extent, 0, total, include_colors)
            .await?;
        if rows.len() as u64 != total {
            return Ok(None);
        }

        let tail = &cursor.tail;
        // Lines only ever move towards index 0, never past `recorded`.
        let latest = rows.len().min(cursor.recorded as usize);
        let found = if tail.is_empty() {
            (cursor.recorded == 0).then_some(0)
        } else {
            let mut hits = (tail.len()..=latest).filter(|&end| rows[end - tail.len()..end] == tail[..]);
            match (hits.next(), hits.next()) {
                (Some(end), None) => Some(end as u64),
                _ => None,
            }
        };

        let Some(seen) = found else {
            debug!(pane = %pane, recorded = cursor.recorded, total, "reader position lost");
            return Ok(Some(Delta::Gap {
                recorded: cursor.recorded,
                current: total,
            }));
        };
        if seen != cursor.recorded {
            debug!(pane = %pane, shifted = cursor.recorded - seen, "history scrolled off");
        }
        Ok(Some(deliver(rows, 0, seen, total, max_lines, cursor)))
    }

    /// Baseline for a new reader, returning up to `initial_lines` recent lines.
    pub async fn snapshot(
        &self,
        pane: &PaneId,
        initial_lines: usize,
        include_colors: bool,
    ) -> ToolResult<Snapshot> {
        let mut last_extent = None;
        for _ in 0..STABLE_READ_ATTEMPTS {
            let before = self.mux.extent(pane).await?;
            let total = before.completed();
            let take = (initial_lines as u64).min(total);
            // Always read enough to seed the tail.
            let start = total.saturating_sub(take.max(TAIL_LINES as u64));
            let rows = self
                .capture_indices(pane, &before, start, total, include_colors)
                .await?;
            let after = self.mux.extent(pane).await?;
            if after.history_size != before.history_size || rows.len() as u64 != total - start {
                last_extent = Some(after);
                continue;
            }

            let tail = rows[rows.len().saturating_sub(TAIL_LINES)..].to_vec();
            let skip = rows.len() - take as usize;
            return Ok(Snapshot {
                lines: rows.into_iter().skip(skip).collect(),
                truncated: initial_lines > 0 && total > initial_lines as u64,
                cursor: Cursor {
                    recorded: total,
                    delivered: total,
                    tail,
                },
            });
        }

        Err(ToolError::MultiplexerUnavailable(format!(
            "pane {pane} kept scrolling while taking a baseline (last extent {:?})",
            last_extent
        )))
    }

    /// The last `lines` rows up to and including the cursor row.
    pub async fn read(&self, pane: &PaneId, options: CaptureOptions) -> ToolResult<PaneRead> {
        let CaptureOptions {
            lines,
            include_colors,
        } = options;
        if lines == 0 {
            return Err(ToolError::InvalidArgument("lines must be positive".into()));
        }
        let extent = self.mux.extent(pane).await?;
        let visible = extent.completed() + 1;
        let take = visible.min(lines as u64);
        let content = self
            .capture_indices(pane, &extent, visible - take, visible, include_colors)
            .await?;
        Ok(PaneRead {
            pane: pane.clone(),
            lines_requested: lines,
            lines_returned: content.len(),
            truncated: visible > lines as u64,
            include_colors,
            content,
        })
    }

    /// Capture absolute indices `[start, end)`.
    async fn capture_indices(
        &self,
        pane: &PaneId,
        extent: &PaneExtent,
        start: u64,
        end: u64,
        include_colors: bool,
    ) -> ToolResult<Vec<String>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let span = LineSpan::new(extent.row_of(start), extent.row_of(end - 1));
        self.mux.capture(pane, span, include_colors).await
    }
}

/// Build the delta from `rows`, which cover `[base, total)` and start at or
/// before both the first returned line and the new tail.
fn deliver(
    rows: Vec<String>,
    base: u64,
    seen: u64,
    total: u64,
    max_lines: usize,
    cursor: &Cursor,
) -> Delta {
    let new_line_count = total - seen;
    let take = new_line_count.min(max_lines as u64);
    let tail = rows[rows.len().saturating_sub(TAIL_LINES)..].to_vec();
    let lines = rows[(total - take - base) as usize..].to_vec();
    Delta::Lines {
        lines,
        new_line_count,
        truncated: new_line_count > take,
        cursor: Cursor {
            recorded: total,
            delivered: cursor.delivered + new_line_count,
            tail,
        },
    }
}
