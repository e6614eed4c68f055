use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod bus;
pub mod templates;

/// Days between purchase and the first renewal.
pub const BILLING_PERIOD_DAYS: i64 = 30;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,  // Provisioning run in flight
    Running,   // Hypervisor reports running
    Stopped,   // Powered off
    Suspended, // Paused/suspended on the hypervisor
    Deleted,   // Soft-deleted, kept for billing history
    Failed,    // Provisioning aborted
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Deleted => "deleted",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown instance status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for InstanceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "creating" => Ok(InstanceStatus::Creating),
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            "suspended" => Ok(InstanceStatus::Suspended),
            "deleted" => Ok(InstanceStatus::Deleted),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Failure classes surfaced to support tooling. The string form is stable.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Authentication,
    NoCapacity,
    NoIdentifierAvailable,
    IdentifierCollision,
    UnknownTemplate,
    TaskTimeout,
    HypervisorUnavailable,
    Hypervisor,
    NotFound,
    InstanceDeleted,
    /// A provisioning run still owns the instance.
    InstanceProvisioning,
    Repository,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AUTHENTICATION",
            ErrorKind::NoCapacity => "NO_CAPACITY",
            ErrorKind::NoIdentifierAvailable => "NO_IDENTIFIER_AVAILABLE",
            ErrorKind::IdentifierCollision => "IDENTIFIER_COLLISION",
            ErrorKind::UnknownTemplate => "UNKNOWN_TEMPLATE",
            ErrorKind::TaskTimeout => "TASK_TIMEOUT",
            ErrorKind::HypervisorUnavailable => "HYPERVISOR_UNAVAILABLE",
            ErrorKind::Hypervisor => "HYPERVISOR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InstanceDeleted => "INSTANCE_DELETED",
            ErrorKind::InstanceProvisioning => "INSTANCE_PROVISIONING",
            ErrorKind::Repository => "REPOSITORY",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }

    /// Whether a later attempt of the same step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::IdentifierCollision | ErrorKind::HypervisorUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Value objects ---

/// Resources frozen at purchase time. Never mutated after creation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpec {
    pub cpu: u32,
    pub ram_gb: u32,
    pub storage_gb: u32,
    pub bandwidth_gb: u32,
}

impl ResourceSpec {
    pub fn memory_mb(&self) -> u64 {
        u64::from(self.ram_gb) * 1024
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Pricing {
    pub monthly_price: f64,
    pub currency: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// Catalog plan as it was when the purchase was paid.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlanSnapshot {
    pub name: String,
    pub cpu: u32,
    pub ram_gb: u32,
    pub storage_gb: u32,
    #[serde(default)]
    pub bandwidth_gb: u32,
    pub monthly_price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl PlanSnapshot {
    pub fn resource_spec(&self) -> ResourceSpec {
        ResourceSpec {
            cpu: self.cpu,
            ram_gb: self.ram_gb,
            storage_gb: self.storage_gb,
            bandwidth_gb: self.bandwidth_gb,
        }
    }

    pub fn pricing(&self) -> Pricing {
        Pricing {
            monthly_price: self.monthly_price,
            currency: self.currency.clone(),
        }
    }
}

/// Billing trigger: a paid order for `quantity` identical VMs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PurchaseRequest {
    pub plan: PlanSnapshot,
    pub owner_id: String,
    pub owner_name: String,
    pub owner_email: String,
    #[serde(default = "default_operating_system")]
    pub operating_system: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_operating_system() -> String {
    "Ubuntu 22.04 LTS".to_string()
}

fn default_quantity() -> u32 {
    1
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub plan: String,

    // Hypervisor identity. vmid 0 means "not allocated yet".
    pub vmid: u32,
    pub node: String,

    pub status: InstanceStatus,
    pub operating_system: String,
    pub ip_address: Option<String>,
    pub private_ip_address: Option<String>,

    pub spec: ResourceSpec,
    pub pricing: Pricing,
    pub next_billing_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,
    pub failure: Option<FailureInfo>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Fresh `creating` record for one unit of a purchase.
    pub fn new_creating(req: &PurchaseRequest, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: req.owner_id.clone(),
            name,
            plan: req.plan.name.clone(),
            vmid: 0,
            node: String::new(),
            status: InstanceStatus::Creating,
            operating_system: req.operating_system.clone(),
            ip_address: None,
            private_ip_address: None,
            spec: req.plan.resource_spec(),
            pricing: req.plan.pricing(),
            next_billing_at: now + Duration::days(BILLING_PERIOD_DAYS),
            root_password: None,
            failure: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == InstanceStatus::Deleted || self.deleted_at.is_some()
    }

    pub fn has_vm(&self) -> bool {
        self.vmid != 0 && !self.node.is_empty()
    }

    /// Apply a partial update. Resource spec fields are not patchable.
    pub fn apply(&mut self, patch: InstancePatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(vmid) = patch.vmid {
            self.vmid = vmid;
        }
        if let Some(node) = patch.node {
            self.node = node;
        }
        if let Some(ip) = patch.ip_address {
            self.ip_address = ip;
        }
        if let Some(ip) = patch.private_ip_address {
            self.private_ip_address = ip;
        }
        if let Some(pw) = patch.root_password {
            self.root_password = pw;
        }
        if let Some(failure) = patch.failure {
            self.failure = failure;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update for an [`Instance`]. `Some(None)` clears an optional field.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InstancePatch {
    pub status: Option<InstanceStatus>,
    pub vmid: Option<u32>,
    pub node: Option<String>,
    pub ip_address: Option<Option<String>>,
    pub private_ip_address: Option<Option<String>>,
    pub root_password: Option<Option<String>>,
    pub failure: Option<Option<FailureInfo>>,
}

impl InstancePatch {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: Some(InstanceStatus::Failed),
            failure: Some(Some(FailureInfo {
                kind,
                message: message.into(),
            })),
            ..Default::default()
        }
    }
}
