//! Trigger detection for the PTY wrapper.
//!
//! Two ways to start an activation: the escape chord (`Ctrl-]` then the
//! trigger key) typed by the user, or a marker string printed by the
//! wrapped program. Both scanners are fed raw byte chunks as they arrive.

/// `Ctrl-]`.
pub const ESCAPE_BYTE: u8 = 0x1d;

/// Default marker printed by programs that want to open the agent pane.
pub const DEFAULT_MARKER: &str = "[[WRAPPER:TOOL]]";

/// Result of scanning one chunk of user input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KeyScan {
    /// Bytes to forward to the child.
    pub passthrough: Vec<u8>,
    /// How many times the chord completed in this chunk.
    pub triggers: usize,
}

/// Two-key chord state machine. The escape byte is swallowed; if the next
/// byte is not the trigger key both are forwarded unchanged.
#[derive(Debug, Clone)]
pub struct HotkeyDetector {
    trigger: u8,
    armed: bool,
}

impl HotkeyDetector {
    /// `trigger` is matched case-insensitively. Non-ASCII keys fall back to `u`.
    pub fn new(trigger: char) -> Self {
        let trigger = if trigger.is_ascii() { trigger as u8 } else { b'u' };
        Self {
            trigger: trigger.to_ascii_lowercase(),
            armed: false,
        }
    }

    /// Whether the last chunk ended right after the escape byte.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn feed(&mut self, input: &[u8]) -> KeyScan {
        let mut scan = KeyScan::default();
        for &byte in input {
            if self.armed {
                self.armed = false;
                if byte.to_ascii_lowercase() == self.trigger {
                    scan.triggers += 1;
                } else {
                    scan.passthrough.push(ESCAPE_BYTE);
                    scan.passthrough.push(byte);
                }
                continue;
            }
            if byte == ESCAPE_BYTE {
                self.armed = true;
                continue;
            }
            scan.passthrough.push(byte);
        }
        scan
    }
}

/// Finds a marker in a byte stream, including across chunk boundaries.
#[derive(Debug, Clone)]
pub struct MarkerWatcher {
    marker: Vec<u8>,
    tail: Vec<u8>,
}

impl MarkerWatcher {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.as_bytes().to_vec(),
            tail: Vec::new(),
        }
    }

    /// Number of marker occurrences completed by `chunk`.
    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        if self.marker.is_empty() {
            return 0;
        }
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        let mut found = 0;
        let mut start = 0;
        while let Some(pos) = find(&window[start..], &self.marker) {
            found += 1;
            start += pos + self.marker.len();
        }

        let keep = (self.marker.len() - 1).min(window.len() - start);
        self.tail = window[window.len() - keep..].to_vec();
        found
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Whether `argv` launches gdb (or a `gdb-*` variant).
pub fn is_gdb(argv: &[String]) -> bool {
    argv.first()
        .and_then(|cmd| std::path::Path::new(cmd).file_name())
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("gdb"))
}

/// The child's argv: `command`, or a login shell when it is empty. gdb gets
/// a `tool` command that prints the marker when `gdb_inject` is set.
pub fn child_argv(
    command: &[String],
    shell: Option<&str>,
    gdb_inject: bool,
    marker: &str,
) -> Vec<String> {
    if command.is_empty() {
        let shell = shell.filter(|s| !s.is_empty()).unwrap_or("bash");
        let mut argv = vec![shell.to_string()];
        if shell.ends_with("bash") {
            argv.push("-l".to_string());
        }
        return argv;
    }

    if gdb_inject && is_gdb(command) {
        let echo = format!("echo {marker}\\n");
        let mut argv = vec![command[0].clone()];
        for ex in ["define tool", echo.as_str(), "end"] {
            argv.push("-ex".to_string());
            argv.push(ex.to_string());
        }
        argv.extend(command[1..].iter().cloned());
        return argv;
    }

    command.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chord_triggers_and_is_swallowed() {
        let mut keys = HotkeyDetector::new('u');
        let scan = keys.feed(b"ab\x1duc");
        assert_eq!(scan.passthrough, b"abc");
        assert_eq!(scan.triggers, 1);
    }

    #[test]
    fn chord_is_case_insensitive() {
        let mut keys = HotkeyDetector::new('U');
        assert_eq!(keys.feed(b"\x1du").triggers, 1);
        assert_eq!(keys.feed(b"\x1dU").triggers, 1);
    }

    #[test]
    fn other_key_after_escape_passes_both() {
        let mut keys = HotkeyDetector::new('u');
        let scan = keys.feed(b"\x1dx");
        assert_eq!(scan.passthrough, b"\x1dx");
        assert_eq!(scan.triggers, 0);
    }

    #[test]
    fn chord_spans_chunks() {
        let mut keys = HotkeyDetector::new('u');
        let first = keys.feed(b"ls\x1d");
        assert_eq!(first.passthrough, b"ls");
        assert!(keys.is_armed());
        let second = keys.feed(b"u");
        assert_eq!(second.triggers, 1);
        assert!(second.passthrough.is_empty());
        assert!(!keys.is_armed());
    }

    #[test]
    fn marker_found_within_and_across_chunks() {
        let mut watch = MarkerWatcher::new(DEFAULT_MARKER);
        assert_eq!(watch.feed(b"noise [[WRAPPER:TOOL]] more"), 1);
        assert_eq!(watch.feed(b"... [[WRAP"), 0);
        assert_eq!(watch.feed(b"PER:TOOL]]\r\n"), 1);
        assert_eq!(watch.feed(b"[[WRAPPER:TOOL]][[WRAPPER:TOOL]]"), 2);
    }

    #[test]
    fn marker_is_not_counted_twice() {
        let mut watch = MarkerWatcher::new("XY");
        assert_eq!(watch.feed(b"aXY"), 1);
        assert_eq!(watch.feed(b"Z"), 0);
        assert_eq!(watch.feed(b"X"), 0);
        assert_eq!(watch.feed(b"Y"), 1);
    }

    #[test]
    fn empty_marker_never_matches() {
        let mut watch = MarkerWatcher::new("");
        assert_eq!(watch.feed(b"anything"), 0);
    }

    #[test]
    fn default_child_is_login_shell() {
        assert_eq!(child_argv(&[], Some("/bin/bash"), true, "M"), vec!["/bin/bash", "-l"]);
        assert_eq!(child_argv(&[], Some("/usr/bin/zsh"), true, "M"), vec!["/usr/bin/zsh"]);
        assert_eq!(child_argv(&[], None, true, "M"), vec!["bash", "-l"]);
    }

    #[test]
    fn gdb_gets_tool_command() {
        let command: Vec<String> = ["/usr/bin/gdb", "--args", "./a.out"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            child_argv(&command, None, true, "[[M]]"),
            vec![
                "/usr/bin/gdb",
                "-ex",
                "define tool",
                "-ex",
                "echo [[M]]\\n",
                "-ex",
                "end",
                "--args",
                "./a.out"
            ]
        );
        assert_eq!(child_argv(&command, None, false, "[[M]]"), command);
    }

    #[test]
    fn non_gdb_command_is_untouched() {
        let command = vec!["python3".to_string()];
        assert!(!is_gdb(&command));
        assert_eq!(child_argv(&command, None, true, "M"), command);
    }
}
