use cloudvps_common::{ErrorKind, InstancePatch, InstanceStatus};
use cloudvps_providers::inventory::{PowerState, VmStatus};
use cloudvps_providers::{Hypervisor, HypervisorError};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::logger;
use crate::provisioning::hypervisor_kind;
use crate::repository::{InstanceRepository, RepositoryError};

const MB: f64 = 1024.0 * 1024.0;

/// Live usage of one instance as shown on the dashboard.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VpsMetrics {
    /// Percentages, rounded.
    pub cpu_usage: u64,
    pub ram_usage: u64,
    pub disk_usage: u64,
    /// Megabytes since boot, rounded.
    pub network_in: u64,
    pub network_out: u64,
    pub uptime: String,
    pub status: PowerState,
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl MetricsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetricsError::Hypervisor(e) => hypervisor_kind(e),
            MetricsError::Repository(e) => e.kind(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    InSync {
        status: InstanceStatus,
    },
    Updated {
        from: InstanceStatus,
        to: InstanceStatus,
    },
    /// The VM is gone on the hypervisor but the record is not. Logged, not fixed.
    MissingOnHypervisor,
    /// Nothing to compare: unknown, deleted or not yet provisioned.
    Skipped,
}

fn ratio_percent(used: u64, max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    (used as f64 / max as f64 * 100.0).round() as u64
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("{} {}", n, unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// `N days, M hours`, `N hours, M minutes` or `N minutes`.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        format!("{}, {}", plural(days, "day"), plural(hours, "hour"))
    } else if hours > 0 {
        format!("{}, {}", plural(hours, "hour"), plural(minutes, "minute"))
    } else {
        plural(minutes, "minute")
    }
}

pub fn normalize(status: &VmStatus) -> VpsMetrics {
    VpsMetrics {
        cpu_usage: (status.cpu * 100.0).round().max(0.0) as u64,
        ram_usage: ratio_percent(status.mem, status.maxmem),
        disk_usage: ratio_percent(status.disk, status.maxdisk),
        network_in: (status.netin as f64 / MB).round() as u64,
        network_out: (status.netout as f64 / MB).round() as u64,
        uptime: format_uptime(status.uptime),
        status: status.status,
    }
}

pub fn instance_status_for(power: PowerState) -> InstanceStatus {
    match power {
        PowerState::Running => InstanceStatus::Running,
        PowerState::Stopped => InstanceStatus::Stopped,
        PowerState::Paused | PowerState::Suspended => InstanceStatus::Suspended,
    }
}

/// Reads live counters and power state from the hypervisor.
pub struct MetricsReader {
    hypervisor: Arc<dyn Hypervisor>,
    repo: Arc<dyn InstanceRepository>,
}

impl MetricsReader {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, repo: Arc<dyn InstanceRepository>) -> Self {
        Self { hypervisor, repo }
    }

    /// `None` when there is nothing to measure: unknown, deleted or
    /// unprovisioned instance, or a VM the hypervisor does not know.
    pub async fn get_metrics(&self, id: Uuid) -> Result<Option<VpsMetrics>, MetricsError> {
        let Some(inst) = self.repo.get(id).await? else {
            return Ok(None);
        };
        if inst.is_deleted() || !inst.has_vm() {
            return Ok(None);
        }
        match self.hypervisor.vm_status(&inst.node, inst.vmid).await {
            Ok(status) => Ok(Some(normalize(&status))),
            Err(e) if e.is_not_found() => {
                tracing::debug!("[metrics] vm {} not found on '{}'", inst.vmid, inst.node);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bring the stored status in line with the hypervisor's power state.
    pub async fn reconcile(&self, id: Uuid) -> Result<ReconcileOutcome, MetricsError> {
        let Some(inst) = self.repo.get(id).await? else {
            return Ok(ReconcileOutcome::Skipped);
        };
        if inst.is_deleted() || !inst.has_vm() {
            return Ok(ReconcileOutcome::Skipped);
        }

        let power = match self.hypervisor.vm_status(&inst.node, inst.vmid).await {
            Ok(st) => st.status,
            Err(e) if e.is_not_found() => {
                if inst.status != InstanceStatus::Creating {
                    tracing::warn!(
                        "⚠️ [reconcile] instance {} is {} but vm {} is missing on '{}'",
                        inst.id,
                        inst.status,
                        inst.vmid,
                        inst.node
                    );
                    logger::log_quick(
                        "RECONCILE_MISSING_VM",
                        inst.id,
                        Some(format!("vmid={} node={}", inst.vmid, inst.node).as_str()),
                    );
                    return Ok(ReconcileOutcome::MissingOnHypervisor);
                }
                return Ok(ReconcileOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        // A run in flight owns the record.
        if inst.status == InstanceStatus::Creating {
            return Ok(ReconcileOutcome::Skipped);
        }

        let observed = instance_status_for(power);
        if observed == inst.status {
            return Ok(ReconcileOutcome::InSync { status: observed });
        }
        self.repo
            .update(inst.id, InstancePatch::status(observed))
            .await?;
        tracing::info!(
            "🔄 [reconcile] instance {}: {} -> {} (hypervisor reports {})",
            inst.id,
            inst.status,
            observed,
            power
        );
        logger::log_quick(
            "RECONCILE_STATUS",
            inst.id,
            Some(format!("{} -> {}", inst.status, observed).as_str()),
        );
        Ok(ReconcileOutcome::Updated {
            from: inst.status,
            to: observed,
        })
    }
}
