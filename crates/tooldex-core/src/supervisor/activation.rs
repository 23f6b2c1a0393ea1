//! Per-activation worker: watch the panes, then tear everything down.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{SessionState, Shared, MAX_GRACE_PERIOD};
use crate::error::{ToolError, ToolResult};
use crate::pane::{PaneId, PaneState};
use crate::subscription::ActivationId;

/// Consecutive failed checks after which the multiplexer is considered gone.
pub(crate) const MAX_CHECK_FAILURES: u32 = 3;

/// Why an activation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The agent process exited on its own (or crashed).
    AgentExited,
    /// The user cancelled or the supervisor shut down.
    Cancelled,
    /// The primary pane is gone.
    PrimaryGone,
    /// The multiplexer stopped answering.
    MultiplexerLost,
}

/// Outcome of one activation, available once teardown has finished.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub id: ActivationId,
    pub primary: PaneId,
    pub agent_pane: PaneId,
    pub reason: TeardownReason,
    /// Exit status of the agent process, when it was observed.
    pub exit_status: Option<i32>,
    /// Subscriptions this supervisor's own manager closed for the activation.
    /// An agent whose MCP server runs as a separate process holds its
    /// subscriptions there; that server releases them when its stdin closes,
    /// so they are not counted here.
    pub released_subscriptions: usize,
    /// Teardown steps that failed. Teardown continues past each one.
    pub errors: Vec<String>,
}

impl ActivationReport {
    /// The error to surface when the agent ended abnormally on its own.
    pub fn agent_failure(&self) -> Option<ToolError> {
        match (self.reason, self.exit_status) {
            (TeardownReason::AgentExited, Some(0)) => None,
            (TeardownReason::AgentExited, status) => {
                Some(ToolError::AgentProcessFailure { status })
            }
            _ => None,
        }
    }

    pub(crate) fn lost(id: ActivationId, primary: &PaneId, agent_pane: &PaneId) -> Self {
        Self {
            id,
            primary: primary.clone(),
            agent_pane: agent_pane.clone(),
            reason: TeardownReason::Cancelled,
            exit_status: None,
            released_subscriptions: 0,
            errors: vec!["activation worker stopped without a report".into()],
        }
    }
}

/// Result of one look at both panes.
enum Check {
    Running,
    AgentExited(Option<i32>),
    PrimaryGone,
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    id: ActivationId,
    primary: PaneId,
    agent_pane: PaneId,
    mut cancel: watch::Receiver<bool>,
    report_tx: watch::Sender<Option<ActivationReport>>,
) {
    let interval = shared.config.exit_poll_interval;
    let mut failures = 0u32;

    let (reason, mut exit_status) = loop {
        tokio::select! {
            _ = cancel.wait_for(|flag| *flag) => break (TeardownReason::Cancelled, None),
            _ = tokio::time::sleep(interval) => {}
        }

        match check(&shared, &primary, &agent_pane).await {
            Ok(Check::Running) => failures = 0,
            Ok(Check::AgentExited(status)) => break (TeardownReason::AgentExited, status),
            Ok(Check::PrimaryGone) => break (TeardownReason::PrimaryGone, None),
            Err(e) => {
                failures += 1;
                warn!(%id, error = %e, failures, "activation check failed");
                if failures >= MAX_CHECK_FAILURES {
                    break (TeardownReason::MultiplexerLost, None);
                }
            }
        }
    };
    info!(%id, primary = %primary, ?reason, ?exit_status, "activation ending");

    shared.set_state(&primary, SessionState::TearingDown).await;
    let mut errors = Vec::new();

    let released = shared.subscriptions.close_owner(id).await;

    if reason != TeardownReason::AgentExited {
        match stop_agent(&shared, &agent_pane).await {
            Ok(status) => exit_status = status,
            Err(e) => errors.push(format!("terminate {agent_pane}: {e}")),
        }
    }

    if let Err(e) = shared.mux.kill(&agent_pane).await {
        errors.push(format!("kill {agent_pane}: {e}"));
    }

    match shared.mux.set_input_enabled(&primary, true).await {
        Ok(()) | Err(ToolError::PaneNotFound(_)) => {}
        Err(e) => errors.push(format!("unlock {primary}: {e}")),
    }

    for e in &errors {
        warn!(%id, error = %e, "teardown step failed");
    }

    let report = ActivationReport {
        id,
        primary: primary.clone(),
        agent_pane,
        reason,
        exit_status,
        released_subscriptions: released,
        errors,
    };
    shared.release(&primary).await;
    info!(%id, released, "activation torn down");
    let _ = report_tx.send(Some(report));
}

async fn check(shared: &Shared, primary: &PaneId, agent_pane: &PaneId) -> ToolResult<Check> {
    match shared.mux.pane_state(agent_pane).await {
        Ok(PaneState::Exited { status }) => return Ok(Check::AgentExited(status)),
        Ok(PaneState::Alive { .. }) => {}
        Err(ToolError::PaneNotFound(_)) => return Ok(Check::AgentExited(None)),
        Err(e) => return Err(e),
    }
    match shared.mux.pane_state(primary).await {
        Ok(PaneState::Alive { .. }) => Ok(Check::Running),
        Ok(PaneState::Exited { .. }) | Err(ToolError::PaneNotFound(_)) => Ok(Check::PrimaryGone),
        Err(e) => Err(e),
    }
}

/// SIGTERM, then wait out the grace period. Returns the exit status if the
/// agent went down in time.
async fn stop_agent(shared: &Shared, agent_pane: &PaneId) -> ToolResult<Option<i32>> {
    match shared.mux.terminate(agent_pane).await {
        Ok(()) => {}
        Err(ToolError::PaneNotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    }

    let deadline = Instant::now() + shared.config.grace_period.min(MAX_GRACE_PERIOD);
    let interval = shared.config.exit_poll_interval;
    loop {
        match shared.mux.pane_state(agent_pane).await {
            Ok(PaneState::Exited { status }) => return Ok(status),
            Ok(PaneState::Alive { .. }) => {}
            Err(ToolError::PaneNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(agent = %agent_pane, "grace period over");
            return Ok(None);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
