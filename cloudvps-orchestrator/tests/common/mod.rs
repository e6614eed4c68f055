// Shared fixtures: mock hypervisor, in-memory repository and a recording sink
#![allow(dead_code)]

use cloudvps_common::templates::TemplateTable;
use cloudvps_common::{Instance, PlanSnapshot, PurchaseRequest};
use cloudvps_orchestrator::ip_allocator::StaticPoolIpAllocator;
use cloudvps_orchestrator::notifications::RecordingNotificationSink;
use cloudvps_orchestrator::placement::IdAllocator;
use cloudvps_orchestrator::provisioning::InstanceOutcome;
use cloudvps_orchestrator::repository::InMemoryInstanceRepository;
use cloudvps_orchestrator::settings::{LifecycleSettings, ProvisioningSettings};
use cloudvps_orchestrator::{AppState, LifecycleController, MetricsReader, ProvisioningWorkflow};
use cloudvps_providers::mock::MockHypervisor;
use cloudvps_providers::HypervisorConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct Harness {
    pub hv: Arc<MockHypervisor>,
    pub repo: Arc<InMemoryInstanceRepository>,
    pub notifier: Arc<RecordingNotificationSink>,
    pub workflow: Arc<ProvisioningWorkflow>,
    pub lifecycle: Arc<LifecycleController>,
    pub metrics: Arc<MetricsReader>,
}

impl Harness {
    pub fn new(hv: MockHypervisor) -> Self {
        Self::with_settings(hv, ProvisioningSettings::default(), LifecycleSettings::default())
    }

    pub fn with_settings(
        hv: MockHypervisor,
        provisioning: ProvisioningSettings,
        lifecycle: LifecycleSettings,
    ) -> Self {
        let hv = Arc::new(hv);
        let repo = Arc::new(InMemoryInstanceRepository::new());
        let notifier = Arc::new(RecordingNotificationSink::new());
        let ips = Arc::new(StaticPoolIpAllocator::new("203.0.113.", "10.0.0."));
        let allocator = Arc::new(IdAllocator::new(provisioning.vmid_range.clone()));

        let workflow = Arc::new(ProvisioningWorkflow::new(
            hv.clone(),
            repo.clone(),
            notifier.clone(),
            ips.clone(),
            allocator,
            TemplateTable::default(),
            provisioning,
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            hv.clone(),
            repo.clone(),
            notifier.clone(),
            ips,
            lifecycle,
            HypervisorConfig::default(),
        ));
        let metrics = Arc::new(MetricsReader::new(hv.clone(), repo.clone()));

        Self {
            hv,
            repo,
            notifier,
            workflow,
            lifecycle,
            metrics,
        }
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            provisioning: self.workflow.clone(),
            lifecycle: self.lifecycle.clone(),
            metrics: self.metrics.clone(),
            repo: self.repo.clone(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Provision one instance and return it, panicking on failure.
    pub async fn provisioned(&self) -> Instance {
        let outcome = self
            .workflow
            .purchase(&purchase(1), &CancellationToken::new())
            .await;
        match outcome.outcomes.into_iter().next() {
            Some(InstanceOutcome::Provisioned { instance }) => instance,
            other => panic!("provisioning failed: {:?}", other),
        }
    }
}

pub fn professional_plan() -> PlanSnapshot {
    PlanSnapshot {
        name: "Professional".to_string(),
        cpu: 2,
        ram_gb: 4,
        storage_gb: 50,
        bandwidth_gb: 2000,
        monthly_price: 19.99,
        currency: "USD".to_string(),
    }
}

pub fn purchase(quantity: u32) -> PurchaseRequest {
    PurchaseRequest {
        plan: professional_plan(),
        owner_id: "user-42".to_string(),
        owner_name: "John Doe".to_string(),
        owner_email: "john@example.com".to_string(),
        operating_system: "Ubuntu 22.04 LTS".to_string(),
        quantity,
    }
}
