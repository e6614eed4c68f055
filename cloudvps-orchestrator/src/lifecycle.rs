use cloudvps_common::bus::{Notification, OperationFailed};
use cloudvps_common::{ErrorKind, Instance, InstancePatch, InstanceStatus};
use cloudvps_providers::inventory::{BackupEntry, PowerAction, PowerState, TaskRef};
use cloudvps_providers::{Hypervisor, HypervisorConfig, HypervisorError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ip_allocator::IpAllocator;
use crate::logger;
use crate::notifications::NotificationSink;
use crate::poll::{self, PollError};
use crate::provisioning::hypervisor_kind;
use crate::repository::{InstanceRepository, RepositoryError};
use crate::settings::LifecycleSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
    Shutdown,
    Delete,
    CreateBackup,
    ListBackups,
    RestoreBackup,
    ConsoleAccess,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Shutdown => "shutdown",
            LifecycleAction::Delete => "delete",
            LifecycleAction::CreateBackup => "create_backup",
            LifecycleAction::ListBackups => "list_backups",
            LifecycleAction::RestoreBackup => "restore_backup",
            LifecycleAction::ConsoleAccess => "console_access",
        }
    }

    fn log_name(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "START_INSTANCE",
            LifecycleAction::Stop => "STOP_INSTANCE",
            LifecycleAction::Restart => "RESTART_INSTANCE",
            LifecycleAction::Shutdown => "SHUTDOWN_INSTANCE",
            LifecycleAction::Delete => "DELETE_INSTANCE",
            LifecycleAction::CreateBackup => "CREATE_BACKUP",
            LifecycleAction::ListBackups => "LIST_BACKUPS",
            LifecycleAction::RestoreBackup => "RESTORE_BACKUP",
            LifecycleAction::ConsoleAccess => "CONSOLE_ACCESS",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleFailure {
    #[error("instance not found")]
    InstanceNotFound,
    #[error("instance is deleted")]
    InstanceDeleted,
    #[error("instance has no virtual machine yet")]
    NotProvisioned,
    #[error("instance is still being provisioned")]
    Provisioning,
    #[error("vm {vmid} did not stop within {waited:?}")]
    TaskTimeout { vmid: u32, waited: Duration },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl LifecycleFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleFailure::InstanceNotFound | LifecycleFailure::NotProvisioned => {
                ErrorKind::NotFound
            }
            LifecycleFailure::InstanceDeleted => ErrorKind::InstanceDeleted,
            LifecycleFailure::Provisioning => ErrorKind::InstanceProvisioning,
            LifecycleFailure::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            LifecycleFailure::Cancelled => ErrorKind::Cancelled,
            LifecycleFailure::Hypervisor(e) => hypervisor_kind(e),
            LifecycleFailure::Repository(e) => e.kind(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{action} failed for instance {instance_id}: {source}")]
pub struct LifecycleError {
    pub action: LifecycleAction,
    pub instance_id: Uuid,
    pub source: LifecycleFailure,
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConsoleAccess {
    pub url: String,
    pub password: String,
}

/// Power, deletion, backup and console operations on provisioned instances.
///
/// The repository is written only after the hypervisor accepted the action.
/// `restart` is the exception: it records `running` optimistically.
pub struct LifecycleController {
    hypervisor: Arc<dyn Hypervisor>,
    repo: Arc<dyn InstanceRepository>,
    notifier: Arc<dyn NotificationSink>,
    ips: Arc<dyn IpAllocator>,
    settings: LifecycleSettings,
    console: HypervisorConfig,
    cancel: CancellationToken,
}

impl LifecycleController {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        repo: Arc<dyn InstanceRepository>,
        notifier: Arc<dyn NotificationSink>,
        ips: Arc<dyn IpAllocator>,
        settings: LifecycleSettings,
        console: HypervisorConfig,
    ) -> Self {
        Self {
            hypervisor,
            repo,
            notifier,
            ips,
            settings,
            console,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight stop waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn start(&self, id: Uuid) -> Result<Instance, LifecycleError> {
        let action = LifecycleAction::Start;
        let log = logger::log_event(action.log_name(), id, None);
        let res = self.power_on(id).await;
        self.finish(action, id, log, res).await
    }

    pub async fn stop(&self, id: Uuid) -> Result<Instance, LifecycleError> {
        let action = LifecycleAction::Stop;
        let log = logger::log_event(action.log_name(), id, None);
        let res = self.power_off(id, PowerAction::Stop).await;
        self.finish(action, id, log, res).await
    }

    /// Graceful variant of [`stop`](Self::stop): ACPI shutdown, same wait.
    pub async fn shutdown(&self, id: Uuid) -> Result<Instance, LifecycleError> {
        let action = LifecycleAction::Shutdown;
        let log = logger::log_event(action.log_name(), id, None);
        let res = self.power_off(id, PowerAction::Shutdown).await;
        self.finish(action, id, log, res).await
    }

    pub async fn restart(&self, id: Uuid) -> Result<Instance, LifecycleError> {
        let action = LifecycleAction::Restart;
        let log = logger::log_event(action.log_name(), id, None);
        let res = self.reboot(id).await;
        self.finish(action, id, log, res).await
    }

    /// Stop (bounded), remove from the hypervisor, then soft-delete the record.
    ///
    /// If the VM does not stop in time nothing is removed and the stored status
    /// is left as it was.
    pub async fn delete(&self, id: Uuid) -> Result<(), LifecycleError> {
        let action = LifecycleAction::Delete;
        let log = logger::log_event(action.log_name(), id, None);
        let res = self.remove(id).await;
        self.finish(action, id, log, res).await
    }

    pub async fn create_backup(&self, id: Uuid) -> Result<TaskRef, LifecycleError> {
        let action = LifecycleAction::CreateBackup;
        let log = logger::log_event(action.log_name(), id, None);
        let res = async {
            let inst = self.load(id).await?;
            let task = self
                .hypervisor
                .create_backup(&inst.node, inst.vmid, &self.settings.backup_storage)
                .await?;
            tracing::info!(
                "💾 [lifecycle] backup of vm {} started on '{}' ({})",
                inst.vmid,
                self.settings.backup_storage,
                task
            );
            Ok::<_, LifecycleFailure>(task)
        }
        .await;
        self.finish(action, id, log, res).await
    }

    /// Backups of this instance's VM, oldest first.
    pub async fn list_backups(&self, id: Uuid) -> Result<Vec<BackupEntry>, LifecycleError> {
        let res = async {
            let inst = self.load(id).await?;
            let mut backups: Vec<BackupEntry> = self
                .hypervisor
                .list_backups(&inst.node, &self.settings.backup_storage)
                .await?
                .into_iter()
                .filter(|b| b.vmid == Some(inst.vmid))
                .collect();
            backups.sort_by_key(|b| b.ctime.unwrap_or_default());
            Ok::<_, LifecycleFailure>(backups)
        }
        .await;
        // Read-only: failures are returned but not notified.
        res.map_err(|source| LifecycleError {
            action: LifecycleAction::ListBackups,
            instance_id: id,
            source,
        })
    }

    /// Restore `archive` over the instance's VM. The VM is stopped first with
    /// the same bounded wait as `delete`.
    pub async fn restore_backup(&self, id: Uuid, archive: &str) -> Result<TaskRef, LifecycleError> {
        let action = LifecycleAction::RestoreBackup;
        let log = logger::log_event(
            action.log_name(),
            id,
            Some(serde_json::json!({ "archive": archive })),
        );
        let res = async {
            let inst = self.load(id).await?;
            self.ensure_stopped(&inst, PowerAction::Stop).await?;
            let task = self
                .hypervisor
                .restore_backup(&inst.node, inst.vmid, archive, &self.settings.backup_storage)
                .await?;
            self.write_status(&inst, InstanceStatus::Stopped).await?;
            Ok::<_, LifecycleFailure>(task)
        }
        .await;
        self.finish(action, id, log, res).await
    }

    pub async fn console_access(&self, id: Uuid) -> Result<ConsoleAccess, LifecycleError> {
        let res = async {
            let inst = self.load(id).await?;
            let ticket = self.hypervisor.console_ticket(&inst.node, inst.vmid).await?;
            logger::log_quick(LifecycleAction::ConsoleAccess.log_name(), id, None);
            Ok::<_, LifecycleFailure>(ConsoleAccess {
                url: self.console.console_url(ticket.port),
                password: ticket.ticket,
            })
        }
        .await;
        res.map_err(|source| LifecycleError {
            action: LifecycleAction::ConsoleAccess,
            instance_id: id,
            source,
        })
    }

    // ---- steps ----

    async fn power_on(&self, id: Uuid) -> Result<Instance, LifecycleFailure> {
        let inst = self.load(id).await?;
        let current = self.hypervisor.vm_status(&inst.node, inst.vmid).await?;
        if current.status == PowerState::Running {
            tracing::debug!("[lifecycle] vm {} already running", inst.vmid);
        } else {
            self.hypervisor
                .power_action(&inst.node, inst.vmid, PowerAction::Start)
                .await?;
        }
        self.write_status(&inst, InstanceStatus::Running).await
    }

    async fn power_off(&self, id: Uuid, how: PowerAction) -> Result<Instance, LifecycleFailure> {
        let inst = self.load(id).await?;
        self.ensure_stopped(&inst, how).await?;
        self.write_status(&inst, InstanceStatus::Stopped).await
    }

    async fn reboot(&self, id: Uuid) -> Result<Instance, LifecycleFailure> {
        let inst = self.load(id).await?;
        self.hypervisor
            .power_action(&inst.node, inst.vmid, PowerAction::Reboot)
            .await?;
        self.write_status(&inst, InstanceStatus::Running).await
    }

    async fn remove(&self, id: Uuid) -> Result<(), LifecycleFailure> {
        let inst = self.live(id).await?;

        if inst.has_vm() {
            match self.ensure_stopped(&inst, PowerAction::Stop).await {
                Ok(()) => match self.hypervisor.delete_vm(&inst.node, inst.vmid).await {
                    Ok(task) => tracing::info!(
                        "🗑️ [lifecycle] vm {} deleted on '{}' ({})",
                        inst.vmid,
                        inst.node,
                        task
                    ),
                    Err(e) if e.is_not_found() => {
                        tracing::warn!("⚠️ [lifecycle] vm {} vanished before delete", inst.vmid)
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(LifecycleFailure::Hypervisor(e)) if e.is_not_found() => {
                    tracing::warn!(
                        "⚠️ [lifecycle] vm {} already gone from '{}', deleting record only",
                        inst.vmid,
                        inst.node
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !self.repo.soft_delete(id).await? {
            return Err(LifecycleFailure::InstanceNotFound);
        }
        self.ips.release(id).await;
        Ok(())
    }

    /// Issue `how` unless the VM is already stopped, then wait for `stopped`.
    async fn ensure_stopped(&self, inst: &Instance, how: PowerAction) -> Result<(), LifecycleFailure> {
        let current = self.hypervisor.vm_status(&inst.node, inst.vmid).await?;
        if current.status == PowerState::Stopped {
            return Ok(());
        }
        self.hypervisor
            .power_action(&inst.node, inst.vmid, how)
            .await?;

        let hv = self.hypervisor.as_ref();
        let (node, vmid) = (inst.node.as_str(), inst.vmid);
        poll::poll_until(
            self.settings.status_poll_interval,
            self.settings.stop_timeout,
            &self.cancel,
            || async move {
                match hv.vm_status(node, vmid).await {
                    Ok(st) if st.status == PowerState::Stopped => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) if e.is_retryable() => Ok(None),
                    Err(e) => Err(LifecycleFailure::from(e)),
                }
            },
        )
        .await
        .map_err(|e| match e {
            PollError::TimedOut { waited } => LifecycleFailure::TaskTimeout { vmid, waited },
            PollError::Cancelled => LifecycleFailure::Cancelled,
            PollError::Failed(e) => e,
        })
    }

    async fn live(&self, id: Uuid) -> Result<Instance, LifecycleFailure> {
        let inst = self
            .repo
            .get(id)
            .await?
            .ok_or(LifecycleFailure::InstanceNotFound)?;
        if inst.is_deleted() {
            return Err(LifecycleFailure::InstanceDeleted);
        }
        // The run writes vmid and node before the clone finishes; nothing may
        // touch the VM until it leaves `creating`.
        if inst.status == InstanceStatus::Creating {
            return Err(LifecycleFailure::Provisioning);
        }
        Ok(inst)
    }

    async fn load(&self, id: Uuid) -> Result<Instance, LifecycleFailure> {
        let inst = self.live(id).await?;
        if !inst.has_vm() {
            return Err(LifecycleFailure::NotProvisioned);
        }
        Ok(inst)
    }

    async fn write_status(
        &self,
        inst: &Instance,
        status: InstanceStatus,
    ) -> Result<Instance, LifecycleFailure> {
        if inst.status != status {
            tracing::info!(
                "🔄 [lifecycle] instance {}: {} -> {}",
                inst.id,
                inst.status,
                status
            );
        }
        self.repo
            .update(inst.id, InstancePatch::status(status))
            .await?
            .ok_or(LifecycleFailure::InstanceNotFound)
    }

    async fn finish<T>(
        &self,
        action: LifecycleAction,
        id: Uuid,
        log: logger::ActionLog,
        res: Result<T, LifecycleFailure>,
    ) -> Result<T, LifecycleError> {
        match res {
            Ok(v) => {
                logger::log_event_complete(log, "success", None);
                Ok(v)
            }
            Err(source) => {
                let err = LifecycleError {
                    action,
                    instance_id: id,
                    source,
                };
                let message = err.to_string();
                logger::log_event_complete(log, "failed", Some(message.as_str()));
                tracing::error!("❌ [lifecycle] {}", message);

                let owner_id = match self.repo.get(id).await {
                    Ok(Some(inst)) => inst.owner_id,
                    _ => String::new(),
                };
                let notification = Notification::Failed(OperationFailed {
                    instance_id: id,
                    owner_id,
                    action: action.as_str().to_string(),
                    error_kind: err.kind(),
                    message,
                });
                if let Err(e) = self.notifier.publish(notification).await {
                    tracing::error!("❌ [lifecycle] notification not delivered: {:#}", e);
                }
                Err(err)
            }
        }
    }
}
