use thiserror::Error;

/// Errors produced by the pane streaming and activation layers.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown subscription token: {0}")]
    UnknownToken(String),

    #[error("pane not found: {0}")]
    PaneNotFound(String),

    #[error("multiplexer unavailable: {0}")]
    MultiplexerUnavailable(String),

    /// The pane's line history shrank or was rewritten since the last delivery.
    #[error("output discontinuity on {token}: {recorded} lines recorded, pane now reports {current}")]
    Gap {
        token: String,
        recorded: u64,
        current: u64,
    },

    #[error("operation cancelled: activation is tearing down")]
    Cancelled,

    #[error("agent process failed with status {}", .status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()))]
    AgentProcessFailure { status: Option<i32> },

    #[error("an activation is already running for pane {0}")]
    ActivationInProgress(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A multiplexer call that failed in a way worth retrying (timeout, odd exit).
    #[error("multiplexer command failed: {0}")]
    Transient(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ToolError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownToken(_) => "unknown_token",
            ToolError::PaneNotFound(_) => "pane_not_found",
            ToolError::MultiplexerUnavailable(_) => "multiplexer_unavailable",
            ToolError::Gap { .. } => "gap",
            ToolError::Cancelled => "cancelled",
            ToolError::AgentProcessFailure { .. } => "agent_process_failure",
            ToolError::ActivationInProgress(_) => "activation_in_progress",
            ToolError::InvalidArgument(_) => "invalid_argument",
            ToolError::Transient(_) => "multiplexer_unavailable",
            ToolError::Io(_) => "io",
            ToolError::Other(_) => "internal",
        }
    }

    /// Whether the adapter should retry the call that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_per_kind() {
        assert_eq!(ToolError::UnknownToken("t".into()).code(), "unknown_token");
        assert_eq!(ToolError::PaneNotFound("%1".into()).code(), "pane_not_found");
        assert_eq!(ToolError::Cancelled.code(), "cancelled");
        let gap = ToolError::Gap {
            token: "t".into(),
            recorded: 10,
            current: 3,
        };
        assert_eq!(gap.code(), "gap");
        assert!(gap.to_string().contains("10 lines recorded"));
    }

    #[test]
    fn only_transient_errors_are_retried() {
        assert!(ToolError::Transient("timeout".into()).is_transient());
        assert!(!ToolError::PaneNotFound("%1".into()).is_transient());
        assert!(!ToolError::MultiplexerUnavailable("no server".into()).is_transient());
    }

    #[test]
    fn agent_failure_message_handles_missing_status() {
        let err = ToolError::AgentProcessFailure { status: None };
        assert!(err.to_string().contains("unknown"));
        let err = ToolError::AgentProcessFailure { status: Some(2) };
        assert!(err.to_string().ends_with('2'));
    }
}
