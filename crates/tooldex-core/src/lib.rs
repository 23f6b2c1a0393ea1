//! tooldex-core: live pane streaming for an AI agent running next to a
//! terminal session.
//!
//! Provides the multiplexer abstraction (tmux and an in-memory mock),
//! finished-line capture with gap detection, token-based subscriptions
//! with bounded-wait fetches, and the activation supervisor that freezes
//! a primary pane while an agent pane is open.

pub mod capture;
pub mod error;
pub mod pane;
pub mod poll;
pub mod subscription;
pub mod supervisor;

// Re-export commonly used items at crate root.
pub use capture::{CaptureOptions, CaptureTracker, PaneRead};
pub use error::{ToolError, ToolResult};
pub use pane::{
    resolve_primary_pane, MockMultiplexer, Multiplexer, PaneId, SplitDirection, SplitLayout,
    TmuxAdapter, TmuxConfig,
};
pub use poll::{FetchOptions, PollResult};
pub use subscription::{ActivationId, SubscribeOptions, SubscriptionInfo, SubscriptionManager};
pub use supervisor::{
    ActivationHandle, ActivationReport, SessionState, Supervisor, SupervisorConfig,
    TeardownReason, MAX_GRACE_PERIOD,
};
