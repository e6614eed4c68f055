use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Steps of one instance's provisioning run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Requested,
    NodeSelected,
    IdAllocated,
    VmCreated,
    Cloned,
    Configured,
    StartRequested,
    RunningUnverified,
    Provisioned,
    Failed,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Requested => "requested",
            ProvisionState::NodeSelected => "node_selected",
            ProvisionState::IdAllocated => "id_allocated",
            ProvisionState::VmCreated => "vm_created",
            ProvisionState::Cloned => "cloned",
            ProvisionState::Configured => "configured",
            ProvisionState::StartRequested => "start_requested",
            ProvisionState::RunningUnverified => "running_unverified",
            ProvisionState::Provisioned => "provisioned",
            ProvisionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisionState::Provisioned | ProvisionState::Failed)
    }

    fn successor(&self) -> Option<ProvisionState> {
        use ProvisionState::*;
        Some(match self {
            Requested => NodeSelected,
            NodeSelected => IdAllocated,
            IdAllocated => VmCreated,
            VmCreated => Cloned,
            Cloned => Configured,
            Configured => StartRequested,
            StartRequested => RunningUnverified,
            RunningUnverified => Provisioned,
            Provisioned | Failed => return None,
        })
    }

    /// Forward by one step, re-allocation after an id collision, or failure
    /// from any non-terminal state.
    pub fn can_transition_to(&self, next: ProvisionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == ProvisionState::Failed
            || self.successor() == Some(next)
            || (*self == ProvisionState::IdAllocated && next == ProvisionState::IdAllocated)
    }
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    pub from: ProvisionState,
    pub to: ProvisionState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// State and transition history of one provisioning run.
#[derive(Clone, Debug, Serialize)]
pub struct ProvisioningRun {
    pub instance_id: Uuid,
    pub state: ProvisionState,
    pub history: Vec<Transition>,
}

impl ProvisioningRun {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            state: ProvisionState::Requested,
            history: Vec::new(),
        }
    }

    /// Move to `to` if allowed. Returns false (and changes nothing) otherwise.
    pub fn advance(&mut self, to: ProvisionState, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if !self.state.can_transition_to(to) {
            tracing::warn!(
                "⚠️ [state_machine] instance {}: refusing {} -> {} ({})",
                self.instance_id,
                self.state,
                to,
                reason
            );
            return false;
        }
        tracing::info!(
            "🔄 [state_machine] instance {}: {} -> {} ({})",
            self.instance_id,
            self.state,
            to,
            reason
        );
        self.history.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
            reason,
        });
        self.state = to;
        true
    }

    pub fn visited(&self) -> Vec<ProvisionState> {
        std::iter::once(ProvisionState::Requested)
            .chain(self.history.iter().map(|t| t.to))
            .collect()
    }
}
