//! In-memory multiplexer.
//!
//! Each pane is a list of rows whose last entry is the cursor row. Panes
//! behave like a tiny shell: sending `echo X` with Enter prints `X` and a
//! new prompt. Tests drive everything else (output, history resets, pane
//! death) through the inherent methods.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{LineSpan, Multiplexer, PaneExtent, PaneId, PaneState, SplitRequest};
use crate::error::{ToolError, ToolResult};

/// Prompt printed by mock panes.
pub const MOCK_PROMPT: &str = "$ ";

#[derive(Debug, Clone)]
struct MockPane {
    rows: Vec<String>,
    height: u64,
    history_limit: u64,
    input_enabled: bool,
    state: PaneState,
    /// Exit status recorded when the pane receives SIGTERM; `None` ignores it.
    exit_on_terminate: Option<i32>,
    sent: Vec<String>,
}

impl MockPane {
    fn new(height: u64, history_limit: u64) -> Self {
        Self {
            rows: vec![MOCK_PROMPT.to_string()],
            height,
            history_limit,
            input_enabled: true,
            state: PaneState::Alive { pid: None },
            exit_on_terminate: Some(143),
            sent: Vec::new(),
        }
    }

    fn history_size(&self) -> u64 {
        (self.rows.len() as u64).saturating_sub(self.height)
    }

    fn extent(&self) -> PaneExtent {
        let history_size = self.history_size();
        PaneExtent {
            history_size,
            history_limit: self.history_limit,
            cursor_y: self.rows.len() as u64 - 1 - history_size,
            height: self.height,
        }
    }

    fn write(&mut self, text: &str) {
        let mut segments = text.split('\n');
        if let Some(first) = segments.next() {
            if let Some(cursor) = self.rows.last_mut() {
                cursor.push_str(first);
            }
        }
        for segment in segments {
            self.rows.push(segment.to_string());
        }
        self.trim_history();
    }

    fn trim_history(&mut self) {
        if self.history_limit == 0 {
            return;
        }
        let excess = self.history_size().saturating_sub(self.history_limit);
        if excess > 0 {
            self.rows.drain(..excess as usize);
        }
    }

    fn run_line(&mut self) {
        let line = self.rows.last().cloned().unwrap_or_default();
        let command = line.strip_prefix(MOCK_PROMPT).unwrap_or(&line).to_string();
        self.write("\n");
        if let Some(rest) = command.strip_prefix("echo ") {
            self.write(rest);
            self.write("\n");
        }
        self.write(MOCK_PROMPT);
    }
}

#[derive(Debug, Default)]
struct MockState {
    panes: HashMap<PaneId, MockPane>,
    next_id: u32,
    splits: Vec<SplitRecord>,
    killed: Vec<PaneId>,
    transient_failures: u32,
    unavailable: bool,
    calls: u64,
}

/// A pane created through [`Multiplexer::split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRecord {
    pub target: PaneId,
    pub pane: PaneId,
    pub command: String,
    pub env: Vec<(String, String)>,
}

/// Thread-safe in-memory multiplexer.
#[derive(Debug, Default)]
pub struct MockMultiplexer {
    state: Mutex<MockState>,
}

impl MockMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pane with a fresh prompt; returns its id.
    pub fn add_pane(&self, height: u64, history_limit: u64) -> PaneId {
        let mut state = self.lock();
        let id = PaneId::new(format!("%{}", state.next_id));
        state.next_id += 1;
        state.panes.insert(id.clone(), MockPane::new(height, history_limit));
        id
    }

    /// Program output written straight to the pane (no command echo).
    pub fn write(&self, pane: &PaneId, text: &str) {
        if let Some(p) = self.lock().panes.get_mut(pane) {
            p.write(text);
        }
    }

    /// Drop all scrollback, as `tmux clear-history` does.
    pub fn clear_history(&self, pane: &PaneId) {
        if let Some(p) = self.lock().panes.get_mut(pane) {
            let history = p.history_size() as usize;
            p.rows.drain(..history);
        }
    }

    /// Replace the pane's contents wholesale while keeping its id.
    pub fn reset(&self, pane: &PaneId, rows: &[&str]) {
        if let Some(p) = self.lock().panes.get_mut(pane) {
            p.rows = rows.iter().map(|r| r.to_string()).collect();
            if p.rows.is_empty() {
                p.rows.push(String::new());
            }
        }
    }

    /// Remove a pane as if it was closed out-of-band.
    pub fn remove_pane(&self, pane: &PaneId) {
        self.lock().panes.remove(pane);
    }

    /// Mark the pane's process as exited.
    pub fn set_exited(&self, pane: &PaneId, status: Option<i32>) {
        if let Some(p) = self.lock().panes.get_mut(pane) {
            p.state = PaneState::Exited { status };
        }
    }

    /// Choose what SIGTERM does to this pane (`None` = ignored).
    pub fn set_exit_on_terminate(&self, pane: &PaneId, status: Option<i32>) {
        if let Some(p) = self.lock().panes.get_mut(pane) {
            p.exit_on_terminate = status;
        }
    }

    /// Make the next `n` calls fail transiently.
    pub fn fail_next(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Simulate the multiplexer server being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn pane_exists(&self, pane: &PaneId) -> bool {
        self.lock().panes.contains_key(pane)
    }

    /// All rows of a pane including the cursor row.
    pub fn rows(&self, pane: &PaneId) -> Vec<String> {
        self.lock()
            .panes
            .get(pane)
            .map(|p| p.rows.clone())
            .unwrap_or_default()
    }

    pub fn input_enabled(&self, pane: &PaneId) -> Option<bool> {
        self.lock().panes.get(pane).map(|p| p.input_enabled)
    }

    /// Text sent to the pane, in order.
    pub fn sent(&self, pane: &PaneId) -> Vec<String> {
        self.lock()
            .panes
            .get(pane)
            .map(|p| p.sent.clone())
            .unwrap_or_default()
    }

    pub fn splits(&self) -> Vec<SplitRecord> {
        self.lock().splits.clone()
    }

    pub fn killed(&self) -> Vec<PaneId> {
        self.lock().killed.clone()
    }

    /// Number of multiplexer calls served so far.
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens inside a failing test.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Count the call and apply injected failures.
    fn begin(&self) -> ToolResult<std::sync::MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls += 1;
        if state.unavailable {
            return Err(ToolError::MultiplexerUnavailable(
                "mock server unavailable".into(),
            ));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ToolError::MultiplexerUnavailable(
                "mock transient failure".into(),
            ));
        }
        Ok(state)
    }
}

fn pane_mut<'a>(state: &'a mut MockState, pane: &PaneId) -> ToolResult<&'a mut MockPane> {
    state
        .panes
        .get_mut(pane)
        .ok_or_else(|| ToolError::PaneNotFound(pane.to_string()))
}

#[async_trait]
impl Multiplexer for MockMultiplexer {
    async fn send(&self, pane: &PaneId, text: &str, press_enter: bool) -> ToolResult<()> {
        let mut state = self.begin()?;
        let p = pane_mut(&mut state, pane)?;
        p.sent.push(text.to_string());
        p.write(text);
        if press_enter {
            p.run_line();
        }
        Ok(())
    }

    async fn send_keys(&self, pane: &PaneId, keys: &[&str]) -> ToolResult<()> {
        let mut state = self.begin()?;
        let p = pane_mut(&mut state, pane)?;
        for key in keys {
            p.sent.push(format!("<{key}>"));
            match *key {
                "Enter" => p.run_line(),
                "C-c" => {
                    p.write("^C\n");
                    p.write(MOCK_PROMPT);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn capture(
        &self,
        pane: &PaneId,
        span: LineSpan,
        _include_colors: bool,
    ) -> ToolResult<Vec<String>> {
        let mut state = self.begin()?;
        let p = pane_mut(&mut state, pane)?;
        if span.is_empty() {
            return Ok(Vec::new());
        }
        let history = p.history_size() as i64;
        let last_row = history + p.height as i64 - 1;
        let start = (span.start + history).max(0);
        let end = (span.end + history).min(last_row);
        Ok((start..=end)
            .map(|i| p.rows.get(i as usize).cloned().unwrap_or_default())
            .collect())
    }

    async fn extent(&self, pane: &PaneId) -> ToolResult<PaneExtent> {
        let mut state = self.begin()?;
        Ok(pane_mut(&mut state, pane)?.extent())
    }

    async fn list_panes(&self) -> ToolResult<Vec<PaneId>> {
        let state = self.begin()?;
        let mut panes: Vec<PaneId> = state.panes.keys().cloned().collect();
        panes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(panes)
    }

    async fn split(&self, request: &SplitRequest<'_>) -> ToolResult<PaneId> {
        let mut state = self.begin()?;
        let (height, history_limit) = {
            let target = pane_mut(&mut state, request.target)?;
            (target.height, target.history_limit)
        };
        let id = PaneId::new(format!("%{}", state.next_id));
        state.next_id += 1;
        state
            .panes
            .insert(id.clone(), MockPane::new(height, history_limit));
        state.splits.push(SplitRecord {
            target: request.target.clone(),
            pane: id.clone(),
            command: request.command.to_string(),
            env: request.env.to_vec(),
        });
        Ok(id)
    }

    async fn pane_state(&self, pane: &PaneId) -> ToolResult<PaneState> {
        let mut state = self.begin()?;
        Ok(pane_mut(&mut state, pane)?.state)
    }

    async fn set_input_enabled(&self, pane: &PaneId, enabled: bool) -> ToolResult<()> {
        let mut state = self.begin()?;
        pane_mut(&mut state, pane)?.input_enabled = enabled;
        Ok(())
    }

    async fn terminate(&self, pane: &PaneId) -> ToolResult<()> {
        let mut state = self.begin()?;
        let p = pane_mut(&mut state, pane)?;
        if let (PaneState::Alive { .. }, Some(status)) = (p.state, p.exit_on_terminate) {
            p.state = PaneState::Exited {
                status: Some(status),
            };
        }
        Ok(())
    }

    async fn kill(&self, pane: &PaneId) -> ToolResult<()> {
        let mut state = self.begin()?;
        if state.panes.remove(pane).is_some() {
            state.killed.push(pane.clone());
        }
        Ok(())
    }
}

/// Panes that exist in `mux` but not in `before`.
pub async fn leaked_panes(mux: &MockMultiplexer, before: &[PaneId]) -> Vec<PaneId> {
    let known: HashSet<&PaneId> = before.iter().collect();
    mux.list_panes()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|p| !known.contains(p))
        .collect()
}
