use chrono::{DateTime, Utc};
use cloudvps_common::bus::{Notification, OperationFailed, VpsProvisioned};
use cloudvps_common::templates::TemplateTable;
use cloudvps_common::{ErrorKind, Instance, InstancePatch, InstanceStatus, PurchaseRequest};
use cloudvps_providers::inventory::{PowerAction, PowerState, TaskRef, TaskStatus, VmConfig, VmSpec};
use cloudvps_providers::{Hypervisor, HypervisorError};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::credentials;
use crate::ip_allocator::{IpAllocator, IpAssignment};
use crate::logger;
use crate::notifications::NotificationSink;
use crate::placement::{self, IdAllocator, PlacementError};
use crate::poll::{self, PollError};
use crate::repository::{InstanceRepository, RepositoryError};
use crate::settings::ProvisioningSettings;
use crate::state_machine::{ProvisionState, ProvisioningRun};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("no hypervisor node available")]
    NoCapacity,
    #[error("no free vmid in {start}..={end}")]
    NoIdentifierAvailable { start: u32, end: u32 },
    #[error("vmid collision persisted after {attempts} attempts (last vmid {last_vmid})")]
    IdentifierCollision { attempts: u32, last_vmid: u32 },
    #[error("no template for operating system '{0}'")]
    UnknownTemplate(String),
    #[error("{step} did not finish within {waited:?}")]
    TaskTimeout { step: &'static str, waited: Duration },
    #[error("{step} task failed: {exitstatus}")]
    TaskFailed {
        step: &'static str,
        exitstatus: String,
    },
    #[error("cancelled during {step}")]
    Cancelled { step: &'static str },
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::NoCapacity => ErrorKind::NoCapacity,
            ProvisionError::NoIdentifierAvailable { .. } => ErrorKind::NoIdentifierAvailable,
            ProvisionError::IdentifierCollision { .. } => ErrorKind::IdentifierCollision,
            ProvisionError::UnknownTemplate(_) => ErrorKind::UnknownTemplate,
            ProvisionError::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            ProvisionError::TaskFailed { .. } => ErrorKind::Hypervisor,
            ProvisionError::Cancelled { .. } => ErrorKind::Cancelled,
            ProvisionError::Hypervisor(e) => hypervisor_kind(e),
            ProvisionError::Repository(e) => e.kind(),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Hypervisor(e) if e.is_retryable())
    }
}

pub fn hypervisor_kind(e: &HypervisorError) -> ErrorKind {
    match e {
        HypervisorError::Authentication { .. } => ErrorKind::Authentication,
        HypervisorError::Unavailable { .. } => ErrorKind::HypervisorUnavailable,
        HypervisorError::VmidInUse { .. } => ErrorKind::IdentifierCollision,
        HypervisorError::NotFound { .. } => ErrorKind::NotFound,
        HypervisorError::Api { .. } | HypervisorError::Decode { .. } => ErrorKind::Hypervisor,
    }
}

impl From<PlacementError> for ProvisionError {
    fn from(e: PlacementError) -> Self {
        match e {
            PlacementError::NoCapacity => ProvisionError::NoCapacity,
            PlacementError::NoIdentifierAvailable { start, end } => {
                ProvisionError::NoIdentifierAvailable { start, end }
            }
            PlacementError::Hypervisor(e) => ProvisionError::Hypervisor(e),
        }
    }
}

fn from_poll(step: &'static str, e: PollError<ProvisionError>) -> ProvisionError {
    match e {
        PollError::TimedOut { waited } => ProvisionError::TaskTimeout { step, waited },
        PollError::Cancelled => ProvisionError::Cancelled { step },
        PollError::Failed(e) => e,
    }
}

/// Result of one unit of a purchase.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Provisioned { instance: Instance },
    Failed {
        instance_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
}

impl InstanceOutcome {
    pub fn instance_id(&self) -> Uuid {
        match self {
            InstanceOutcome::Provisioned { instance } => instance.id,
            InstanceOutcome::Failed { instance_id, .. } => *instance_id,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        matches!(self, InstanceOutcome::Provisioned { .. })
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PurchaseOutcome {
    pub outcomes: Vec<InstanceOutcome>,
}

impl PurchaseOutcome {
    pub fn provisioned_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_provisioned()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.provisioned_count()
    }
}

/// `lowercase(owner)-lowercase(plan)` with whitespace runs turned into `-`.
pub fn vm_name(owner_name: &str, plan_name: &str) -> String {
    let slug = |s: &str| {
        s.split_whitespace()
            .map(|w| w.to_lowercase())
            .collect::<Vec<_>>()
            .join("-")
    };
    format!("{}-{}", slug(owner_name), slug(plan_name))
}

/// Turns paid purchases into running VMs.
pub struct ProvisioningWorkflow {
    hypervisor: Arc<dyn Hypervisor>,
    repo: Arc<dyn InstanceRepository>,
    notifier: Arc<dyn NotificationSink>,
    ips: Arc<dyn IpAllocator>,
    allocator: Arc<IdAllocator>,
    templates: TemplateTable,
    settings: ProvisioningSettings,
}

struct Prepared<'a> {
    req: &'a PurchaseRequest,
    instance: Instance,
    template_id: u32,
}

impl ProvisioningWorkflow {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        repo: Arc<dyn InstanceRepository>,
        notifier: Arc<dyn NotificationSink>,
        ips: Arc<dyn IpAllocator>,
        allocator: Arc<IdAllocator>,
        templates: TemplateTable,
        settings: ProvisioningSettings,
    ) -> Self {
        Self {
            hypervisor,
            repo,
            notifier,
            ips,
            allocator,
            templates,
            settings,
        }
    }

    pub fn settings(&self) -> &ProvisioningSettings {
        &self.settings
    }

    /// Provision `req.quantity` instances one after another. A failed unit does
    /// not stop or roll back the others.
    pub async fn purchase(&self, req: &PurchaseRequest, cancel: &CancellationToken) -> PurchaseOutcome {
        tracing::info!(
            "🛒 [provisioning] purchase for owner {}: {} x {} ({})",
            req.owner_id,
            req.quantity,
            req.plan.name,
            req.operating_system
        );
        let mut outcome = PurchaseOutcome::default();
        for i in 0..req.quantity {
            let name = format!("{} {}", req.plan.name, i + 1);
            outcome.outcomes.push(self.provision_one(req, name, cancel).await);
        }
        tracing::info!(
            "🛒 [provisioning] purchase for owner {} done: {} provisioned, {} failed",
            req.owner_id,
            outcome.provisioned_count(),
            outcome.failed_count()
        );
        outcome
    }

    /// One full run of the state machine for a single instance.
    pub async fn provision_one(
        &self,
        req: &PurchaseRequest,
        name: String,
        cancel: &CancellationToken,
    ) -> InstanceOutcome {
        let instance = Instance::new_creating(req, name);
        let instance_id = instance.id;
        let log = logger::log_event(
            "PROVISION",
            instance_id,
            Some(serde_json::json!({
                "owner_id": req.owner_id,
                "plan": req.plan.name,
                "operating_system": req.operating_system,
            })),
        );
        let mut run = ProvisioningRun::new(instance_id);

        // The record exists before any hypervisor work so the purchase is visible.
        let result = match self.repo.create(instance).await {
            Ok(instance) => {
                let template_id = self.templates.lookup(&req.operating_system);
                match template_id {
                    Some(template_id) => {
                        let prepared = Prepared {
                            req,
                            instance,
                            template_id,
                        };
                        self.execute(&mut run, prepared, cancel).await
                    }
                    None => Err(ProvisionError::UnknownTemplate(req.operating_system.clone())),
                }
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(instance) => {
                run.advance(ProvisionState::Provisioned, "welcome notification queued");
                self.notify(Notification::Provisioned(self.welcome(req, &instance)))
                    .await;
                logger::log_event_complete(log, "success", None);
                InstanceOutcome::Provisioned { instance }
            }
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                let failed_at = run.state;
                run.advance(ProvisionState::Failed, message.clone());
                tracing::error!(
                    "❌ [provisioning] instance {} failed after {} ({}): {}",
                    instance_id,
                    failed_at,
                    kind,
                    message
                );
                if let Err(repo_err) = self
                    .repo
                    .update(instance_id, InstancePatch::failed(kind, message.clone()))
                    .await
                {
                    tracing::error!(
                        "❌ [provisioning] could not mark instance {} failed: {}",
                        instance_id,
                        repo_err
                    );
                }
                self.notify(Notification::Failed(OperationFailed {
                    instance_id,
                    owner_id: req.owner_id.clone(),
                    action: "provision".to_string(),
                    error_kind: kind,
                    message: message.clone(),
                }))
                .await;
                logger::log_event_complete(log, "failed", Some(message.as_str()));
                InstanceOutcome::Failed {
                    instance_id,
                    kind,
                    message,
                }
            }
        }
    }

    async fn execute(
        &self,
        run: &mut ProvisioningRun,
        prepared: Prepared<'_>,
        cancel: &CancellationToken,
    ) -> Result<Instance, ProvisionError> {
        let Prepared {
            req,
            instance,
            template_id,
        } = prepared;
        let hv = self.hypervisor.as_ref();
        let spec = instance.spec;
        self.checkpoint(cancel, "node selection")?;

        // 1. Node + vmid. `create_vm` is the final arbiter of vmid uniqueness.
        let nodes = self.call("list_nodes", cancel, || hv.list_nodes()).await?;
        let node = placement::select_node(&nodes)?.node.clone();
        run.advance(ProvisionState::NodeSelected, format!("node {}", node));

        let mut vm = VmSpec {
            vmid: 0,
            name: vm_name(&req.owner_name, &req.plan.name),
            cores: spec.cpu,
            memory_mb: spec.memory_mb(),
            disk_gb: spec.storage_gb,
            storage: self.settings.storage.clone(),
            bridge: self.settings.bridge.clone(),
            ostype: "l26".to_string(),
            agent: true,
            onboot: true,
        };
        let max_attempts = self.settings.collision_retries + 1;
        let mut collided = HashSet::new();
        let mut attempt = 0;
        let vmid = loop {
            attempt += 1;
            self.checkpoint(cancel, "vmid allocation")?;
            let lease = self
                .call("allocate_vmid", cancel, || {
                    self.allocator.allocate(hv, &collided)
                })
                .await?;
            vm.vmid = lease.vmid();
            run.advance(
                ProvisionState::IdAllocated,
                format!("vmid {} (attempt {}/{})", vm.vmid, attempt, max_attempts),
            );

            let node_ref = node.as_str();
            let vm_ref = &vm;
            let mut sent = 0u32;
            let created = self
                .call("create_vm", cancel, || {
                    sent += 1;
                    hv.create_vm(node_ref, vm_ref)
                })
                .await;
            match created {
                Ok(()) => break lease.vmid(),
                Err(ProvisionError::Hypervisor(HypervisorError::VmidInUse { vmid, .. })) => {
                    // An earlier attempt may have been applied with its response lost.
                    if sent > 1 && self.created_earlier(node_ref, vm_ref, cancel).await? {
                        tracing::info!(
                            "🔁 [provisioning] vm {} on {} was created by a retried request",
                            vmid,
                            node
                        );
                        break lease.vmid();
                    }
                    tracing::warn!(
                        "⚠️ [provisioning] vmid {} already taken on the cluster (attempt {}/{})",
                        vmid,
                        attempt,
                        max_attempts
                    );
                    collided.insert(vmid);
                    if attempt >= max_attempts {
                        return Err(ProvisionError::IdentifierCollision {
                            attempts: attempt,
                            last_vmid: vmid,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        };
        self.repo
            .update(
                instance.id,
                InstancePatch {
                    vmid: Some(vmid),
                    node: Some(node.clone()),
                    ..Default::default()
                },
            )
            .await?;
        run.advance(ProvisionState::VmCreated, format!("vm {} on {}", vmid, node));

        // 2. Clone the template and wait; nothing may touch the VM while the clone runs.
        let storage = self.settings.storage.as_str();
        let node_ref = node.as_str();
        let task = self
            .call("clone_template", cancel, || {
                hv.clone_template(node_ref, template_id, vmid, storage)
            })
            .await?;
        self.wait_task(node_ref, &task, "clone", self.settings.clone_timeout, cancel)
            .await?;
        run.advance(
            ProvisionState::Cloned,
            format!("template {} -> {}", template_id, vmid),
        );

        // 3. Configure (idempotent).
        let config = VmConfig {
            cores: spec.cpu,
            memory_mb: spec.memory_mb(),
            bridge: self.settings.bridge.clone(),
            rate_limit: (spec.bandwidth_gb > 0).then_some(spec.bandwidth_gb),
        };
        let config_ref = &config;
        self.checkpoint(cancel, "configure")?;
        self.call("configure_vm", cancel, || {
            hv.configure_vm(node_ref, vmid, config_ref)
        })
        .await?;
        run.advance(
            ProvisionState::Configured,
            format!("{} cores, {} MB", config.cores, config.memory_mb),
        );

        // 4. Start.
        self.checkpoint(cancel, "start")?;
        self.call("start_vm", cancel, || {
            hv.power_action(node_ref, vmid, PowerAction::Start)
        })
        .await?;
        run.advance(ProvisionState::StartRequested, "start accepted");

        let root_password = credentials::generate_root_password();

        // 5. Verify running, bounded. Not seeing it is not a failure.
        let running = match poll::poll_until(
            self.settings.status_poll_interval,
            self.settings.start_timeout,
            cancel,
            || async move {
                match hv.vm_status(node_ref, vmid).await {
                    Ok(st) if st.status == PowerState::Running => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("⚠️ [provisioning] status poll of {}: {}", vmid, e);
                        Ok(None)
                    }
                    Err(e) => Err(ProvisionError::from(e)),
                }
            },
        )
        .await
        {
            Ok(()) => true,
            Err(PollError::TimedOut { waited }) => {
                tracing::warn!(
                    "⚠️ [provisioning] vm {} not reported running after {:?}, recording as stopped",
                    vmid,
                    waited
                );
                false
            }
            Err(e) => return Err(from_poll("start verification", e)),
        };
        run.advance(
            ProvisionState::RunningUnverified,
            if running {
                "hypervisor reports running"
            } else {
                "start not confirmed"
            },
        );

        // 6. Address, bounded wait.
        let ip = self.wait_for_ip(&instance, cancel).await?;

        let status = if running {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        };
        let updated = self
            .repo
            .update(
                instance.id,
                InstancePatch {
                    status: Some(status),
                    ip_address: Some(ip.as_ref().map(|a| a.public.clone())),
                    private_ip_address: Some(ip.and_then(|a| a.private)),
                    root_password: Some(Some(root_password)),
                    ..Default::default()
                },
            )
            .await?;
        updated.ok_or(ProvisionError::Repository(RepositoryError::Corrupt {
            id: instance.id,
            reason: "instance vanished during provisioning".to_string(),
        }))
    }

    /// Whether `vm` exists on `node` under the name this run gave it.
    async fn created_earlier(
        &self,
        node: &str,
        vm: &VmSpec,
        cancel: &CancellationToken,
    ) -> Result<bool, ProvisionError> {
        let hv = self.hypervisor.as_ref();
        let vms = self.call("list_vms", cancel, || hv.list_vms(node)).await?;
        Ok(vms
            .iter()
            .any(|v| v.vmid == vm.vmid && v.name.as_deref() == Some(vm.name.as_str())))
    }

    async fn wait_for_ip(
        &self,
        instance: &Instance,
        cancel: &CancellationToken,
    ) -> Result<Option<IpAssignment>, ProvisionError> {
        let ips = self.ips.as_ref();
        let res = poll::poll_until(
            self.settings.status_poll_interval,
            self.settings.ip_wait_timeout,
            cancel,
            || async move { Ok::<_, ProvisionError>(ips.assign(instance).await) },
        )
        .await;
        match res {
            Ok(ip) => Ok(Some(ip)),
            Err(PollError::TimedOut { waited }) => {
                tracing::warn!(
                    "⚠️ [provisioning] no address for instance {} after {:?}",
                    instance.id,
                    waited
                );
                Ok(None)
            }
            Err(e) => Err(from_poll("address assignment", e)),
        }
    }

    async fn wait_task(
        &self,
        node: &str,
        task: &TaskRef,
        step: &'static str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let hv = self.hypervisor.as_ref();
        poll::poll_until(
            self.settings.task_poll_interval,
            timeout,
            cancel,
            || async move {
                match hv.task_status(node, task).await {
                    Ok(TaskStatus::Running) => Ok(None),
                    Ok(TaskStatus::Stopped { exit_ok: true, .. }) => Ok(Some(())),
                    Ok(TaskStatus::Stopped { exitstatus, .. }) => Err(ProvisionError::TaskFailed {
                        step,
                        exitstatus: exitstatus.unwrap_or_else(|| "unknown".to_string()),
                    }),
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("⚠️ [provisioning] {} task poll: {}", step, e);
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await
        .map_err(|e| from_poll(step, e))
    }

    /// Run a hypervisor-facing step, retrying transient unavailability with
    /// exponential backoff.
    async fn call<T, E, F, Fut>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, ProvisionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProvisionError>,
    {
        let attempts = self.settings.hypervisor_retries.max(1);
        let mut attempt = 1;
        loop {
            match f().await.map_err(Into::<ProvisionError>::into) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = poll::backoff(self.settings.retry_backoff, attempt);
                    tracing::warn!(
                        "⚠️ [provisioning] {} unavailable (attempt {}/{}), retrying in {:?}: {}",
                        op,
                        attempt,
                        attempts,
                        delay,
                        e
                    );
                    if !poll::pause(delay, cancel).await {
                        return Err(ProvisionError::Cancelled { step: op });
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn checkpoint(&self, cancel: &CancellationToken, step: &'static str) -> Result<(), ProvisionError> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled { step });
        }
        Ok(())
    }

    fn welcome(&self, req: &PurchaseRequest, instance: &Instance) -> VpsProvisioned {
        VpsProvisioned {
            owner_email: req.owner_email.clone(),
            instance_name: instance.name.clone(),
            ip_address: instance.ip_address.clone(),
            os: instance.operating_system.clone(),
            cpu: instance.spec.cpu,
            ram: instance.spec.ram_gb,
            storage: instance.spec.storage_gb,
            root_password: instance.root_password.clone().unwrap_or_default(),
            management_url: format!("{}/vps/{}", self.settings.app_base_url, instance.id),
        }
    }

    async fn notify(&self, notification: Notification) {
        if let Err(e) = self.notifier.publish(notification).await {
            tracing::error!("❌ [provisioning] notification not delivered: {:#}", e);
        }
    }
}

/// Mark `creating` instances left behind by a previous process as failed.
///
/// Hypervisor-side VMs of those runs are left in place for administrative
/// adoption or cleanup.
pub async fn recover_stale_provisioning(
    repo: &dyn InstanceRepository,
    notifier: &dyn NotificationSink,
    older_than: Duration,
    now: DateTime<Utc>,
) -> Result<usize, RepositoryError> {
    let cutoff = now
        - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
    let stale: Vec<Instance> = repo
        .list_by_status(InstanceStatus::Creating)
        .await?
        .into_iter()
        .filter(|i| i.created_at < cutoff)
        .collect();

    for inst in &stale {
        let message = format!(
            "provisioning interrupted (creating since {}); hypervisor vm {} on '{}' left for review",
            inst.created_at.to_rfc3339(),
            inst.vmid,
            inst.node
        );
        repo.update(
            inst.id,
            InstancePatch::failed(ErrorKind::TaskTimeout, message.clone()),
        )
        .await?;
        logger::log_quick("RECOVER_STALE_PROVISIONING", inst.id, Some(message.as_str()));
        if let Err(e) = notifier
            .publish(Notification::Failed(OperationFailed {
                instance_id: inst.id,
                owner_id: inst.owner_id.clone(),
                action: "provision".to_string(),
                error_kind: ErrorKind::TaskTimeout,
                message,
            }))
            .await
        {
            tracing::error!("❌ [provisioning] notification not delivered: {:#}", e);
        }
    }
    if !stale.is_empty() {
        tracing::warn!(
            "🔁 [provisioning] marked {} stale creating instance(s) as failed",
            stale.len()
        );
    }
    Ok(stale.len())
}
