//! Activation lifecycle: freeze the primary pane, fork an agent pane,
//! resume the user's session when the agent is done.
//!
//! Each primary pane moves through `Idle → Activating → Active →
//! TearingDown → Idle`. A trigger is accepted only in `Idle`. Once active,
//! a dedicated task watches the agent pane and the primary pane and runs
//! teardown whatever the reason for ending.

mod activation;

pub use activation::{ActivationReport, TeardownReason};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::error::{ToolError, ToolResult};
use crate::pane::{Multiplexer, PaneId, SplitLayout, SplitRequest, PRIMARY_PANE_ENV};
use crate::subscription::{ActivationId, SubscriptionManager};

/// Environment variable telling the agent which activation it belongs to.
pub const ACTIVATION_ENV: &str = "TOOLDEX_ACTIVATION";

/// Longest wait between SIGTERM and the forced kill; longer settings are
/// clamped to it.
pub const MAX_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Lifecycle state of one primary pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Activating,
    Active,
    TearingDown,
}

/// How activations are launched and torn down.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Shell command run in the agent pane.
    pub agent_command: String,
    pub layout: SplitLayout,
    /// Time between SIGTERM and a forced pane kill, at most
    /// [`MAX_GRACE_PERIOD`].
    pub grace_period: Duration,
    /// How often the worker checks on the agent and primary panes.
    pub exit_poll_interval: Duration,
    /// Extra environment for the agent pane.
    pub agent_env: Vec<(String, String)>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_command: "tooldex agent".to_string(),
            layout: SplitLayout::default(),
            grace_period: Duration::from_secs(3),
            exit_poll_interval: Duration::from_millis(250),
            agent_env: Vec::new(),
        }
    }
}

struct Slot {
    id: ActivationId,
    state: SessionState,
    agent_pane: Option<PaneId>,
    cancel: Option<watch::Sender<bool>>,
    report: Option<watch::Receiver<Option<ActivationReport>>>,
}

/// Shared between the supervisor and its workers.
pub(crate) struct Shared {
    pub(crate) mux: Arc<dyn Multiplexer>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    pub(crate) config: SupervisorConfig,
    slots: Mutex<HashMap<PaneId, Slot>>,
}

impl Shared {
    pub(crate) async fn set_state(&self, primary: &PaneId, state: SessionState) {
        if let Some(slot) = self.slots.lock().await.get_mut(primary) {
            slot.state = state;
        }
        info!(primary = %primary, ?state, "activation state");
    }

    /// Back to `Idle`: forget the slot entirely.
    pub(crate) async fn release(&self, primary: &PaneId) {
        self.slots.lock().await.remove(primary);
        info!(primary = %primary, state = ?SessionState::Idle, "activation state");
    }
}

/// Owns every activation started from this process.
pub struct Supervisor {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

/// Caller's view of a running activation.
pub struct ActivationHandle {
    pub id: ActivationId,
    pub primary: PaneId,
    pub agent_pane: PaneId,
    cancel: watch::Sender<bool>,
    report: watch::Receiver<Option<ActivationReport>>,
}

impl ActivationHandle {
    /// Ask for teardown (user cancel). Returns immediately.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait until teardown has completed.
    pub async fn wait(mut self) -> ActivationReport {
        wait_report(&mut self.report, &self.primary, self.id, &self.agent_pane).await
    }
}

impl Supervisor {
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        subscriptions: Arc<SubscriptionManager>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                mux,
                subscriptions,
                config,
                slots: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.shared.subscriptions
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Current state of `primary`.
    pub async fn state(&self, primary: &PaneId) -> SessionState {
        self.shared
            .slots
            .lock()
            .await
            .get(primary)
            .map_or(SessionState::Idle, |slot| slot.state)
    }

    /// Handle a trigger on `primary`: lock it, open the agent pane, start
    /// watching. Rejected unless `primary` is idle.
    pub async fn activate(&self, primary: &PaneId) -> ToolResult<ActivationHandle> {
        let id = ActivationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut slots = self.shared.slots.lock().await;
            if let Some(slot) = slots.get(primary) {
                warn!(primary = %primary, state = ?slot.state, "trigger rejected");
                return Err(ToolError::ActivationInProgress(primary.to_string()));
            }
            slots.insert(
                primary.clone(),
                Slot {
                    id,
                    state: SessionState::Activating,
                    agent_pane: None,
                    cancel: None,
                    report: None,
                },
            );
        }
        info!(primary = %primary, %id, state = ?SessionState::Activating, "activation state");

        let agent_pane = match self.launch(primary, id).await {
            Ok(pane) => pane,
            Err(e) => {
                error!(primary = %primary, %id, error = %e, "activation aborted");
                self.shared.release(primary).await;
                return Err(e);
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (report_tx, report_rx) = watch::channel(None);
        {
            let mut slots = self.shared.slots.lock().await;
            if let Some(slot) = slots.get_mut(primary) {
                slot.state = SessionState::Active;
                slot.agent_pane = Some(agent_pane.clone());
                slot.cancel = Some(cancel_tx.clone());
                slot.report = Some(report_rx.clone());
            }
        }
        info!(primary = %primary, %id, agent = %agent_pane, state = ?SessionState::Active, "activation state");

        tokio::spawn(activation::run(
            self.shared.clone(),
            id,
            primary.clone(),
            agent_pane.clone(),
            cancel_rx,
            report_tx,
        ));

        Ok(ActivationHandle {
            id,
            primary: primary.clone(),
            agent_pane,
            cancel: cancel_tx,
            report: report_rx,
        })
    }

    /// Lock the primary pane and open the agent pane, undoing partial work
    /// on failure.
    async fn launch(&self, primary: &PaneId, id: ActivationId) -> ToolResult<PaneId> {
        let mux = &self.shared.mux;
        let config = &self.shared.config;

        mux.set_input_enabled(primary, false).await?;

        let mut env = vec![
            (PRIMARY_PANE_ENV.to_string(), primary.to_string()),
            (ACTIVATION_ENV.to_string(), id.0.to_string()),
        ];
        env.extend(config.agent_env.iter().cloned());

        let request = SplitRequest {
            target: primary,
            layout: &config.layout,
            command: &config.agent_command,
            env: &env,
        };
        match mux.split(&request).await {
            Ok(pane) => Ok(pane),
            Err(e) => {
                if let Err(unlock) = mux.set_input_enabled(primary, true).await {
                    warn!(primary = %primary, error = %unlock, "could not unlock primary pane");
                }
                Err(e)
            }
        }
    }

    /// Cancel `primary`'s activation, if any, and wait for teardown.
    pub async fn cancel(&self, primary: &PaneId) -> Option<ActivationReport> {
        let (id, agent_pane, cancel, mut report) = {
            let slots = self.shared.slots.lock().await;
            let slot = slots.get(primary)?;
            (
                slot.id,
                slot.agent_pane.clone()?,
                slot.cancel.clone()?,
                slot.report.clone()?,
            )
        };
        let _ = cancel.send(true);
        Some(wait_report(&mut report, primary, id, &agent_pane).await)
    }

    /// Tear down every activation (the primary process is exiting).
    pub async fn shutdown(&self) -> Vec<ActivationReport> {
        let primaries: Vec<PaneId> = self.shared.slots.lock().await.keys().cloned().collect();
        let mut reports = Vec::new();
        for primary in primaries {
            if let Some(report) = self.cancel(&primary).await {
                reports.push(report);
            }
        }
        info!(count = reports.len(), "supervisor shut down");
        reports
    }
}

async fn wait_report(
    report: &mut watch::Receiver<Option<ActivationReport>>,
    primary: &PaneId,
    id: ActivationId,
    agent_pane: &PaneId,
) -> ActivationReport {
    match report.wait_for(|r| r.is_some()).await {
        Ok(r) => r.clone().unwrap_or_else(|| ActivationReport::lost(id, primary, agent_pane)),
        Err(_) => ActivationReport::lost(id, primary, agent_pane),
    }
}
