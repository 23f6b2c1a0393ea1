//! Raw mode and terminal size for the PTY wrapper.

use anyhow::{Context, Result};
use crossterm::terminal;
use std::io::Write;

/// Restores cooked mode on drop, so a panic or early return never leaves
/// the user's terminal raw.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Current terminal size as (columns, rows), (80, 24) when unknown.
pub fn get_terminal_size() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => (80, 24),
    }
}

/// Print a wrapper status line. Raw mode needs explicit carriage returns.
pub fn notice(message: &str) {
    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "\r\n[wrapper] {message}\r\n");
    let _ = stdout.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_size_returns_nonzero() {
        let (cols, rows) = get_terminal_size();
        assert!(cols > 0);
        assert!(rows > 0);
    }
}
