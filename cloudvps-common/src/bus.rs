use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ErrorKind, PurchaseRequest};

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_ORCHESTRATOR_COMMANDS: &str = "orchestrator_commands";
pub const CHANNEL_NOTIFICATION_EVENTS: &str = "notification_events";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "CMD:PURCHASE")]
    Purchase(PurchaseRequest),
    #[serde(rename = "CMD:START")]
    Start { instance_id: Uuid },
    #[serde(rename = "CMD:STOP")]
    Stop { instance_id: Uuid },
    #[serde(rename = "CMD:RESTART")]
    Restart { instance_id: Uuid },
    #[serde(rename = "CMD:DELETE")]
    Delete { instance_id: Uuid },
    #[serde(rename = "CMD:BACKUP")]
    Backup { instance_id: Uuid },
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Purchase(_) => "CMD:PURCHASE",
            Command::Start { .. } => "CMD:START",
            Command::Stop { .. } => "CMD:STOP",
            Command::Restart { .. } => "CMD:RESTART",
            Command::Delete { .. } => "CMD:DELETE",
            Command::Backup { .. } => "CMD:BACKUP",
        }
    }
}

// -----------------------------------------------------------------------------
// Notification events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum NotificationType {
    #[serde(rename = "EVT:VPS_PROVISIONED")]
    VpsProvisioned,
    #[serde(rename = "EVT:PROVISIONING_FAILED")]
    ProvisioningFailed,
    #[serde(rename = "EVT:LIFECYCLE_FAILED")]
    LifecycleFailed,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::VpsProvisioned => "EVT:VPS_PROVISIONED",
            NotificationType::ProvisioningFailed => "EVT:PROVISIONING_FAILED",
            NotificationType::LifecycleFailed => "EVT:LIFECYCLE_FAILED",
        }
    }
}

/// Welcome mail payload. Carries the only copy of the root password the owner sees.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VpsProvisioned {
    pub owner_email: String,
    pub instance_name: String,
    pub ip_address: Option<String>,
    pub os: String,
    pub cpu: u32,
    pub ram: u32,
    pub storage: u32,
    pub root_password: String,
    pub management_url: String,
}

impl VpsProvisioned {
    pub fn ssh_command(&self) -> Option<String> {
        self.ip_address.as_ref().map(|ip| format!("ssh root@{}", ip))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OperationFailed {
    pub instance_id: Uuid,
    pub owner_id: String,
    pub action: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum Notification {
    Provisioned(VpsProvisioned),
    Failed(OperationFailed),
}

impl Notification {
    pub fn event_type(&self) -> NotificationType {
        match self {
            Notification::Provisioned(_) => NotificationType::VpsProvisioned,
            Notification::Failed(f) if f.action == "provision" => {
                NotificationType::ProvisioningFailed
            }
            Notification::Failed(_) => NotificationType::LifecycleFailed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: NotificationType,
    pub occurred_at: DateTime<Utc>,
    pub payload: Notification,
    pub source: String,
}

impl NotificationEnvelope {
    pub fn new(payload: Notification, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: payload.event_type(),
            occurred_at: Utc::now(),
            payload,
            source: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_tagged_by_type() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"CMD:DELETE","instance_id":"{}"}}"#, id);
        let cmd: Command = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd, Command::Delete { instance_id: id });
        assert_eq!(cmd.as_str(), "CMD:DELETE");
    }

    #[test]
    fn purchase_command_uses_defaults() {
        let raw = r#"{
            "type": "CMD:PURCHASE",
            "plan": {"name": "Starter", "cpu": 1, "ram_gb": 2, "storage_gb": 25, "monthly_price": 9.99},
            "owner_id": "u1",
            "owner_name": "Jane",
            "owner_email": "jane@example.com"
        }"#;
        let Command::Purchase(req) = serde_json::from_str::<Command>(raw).unwrap() else {
            panic!("expected purchase");
        };
        assert_eq!(req.quantity, 1);
        assert_eq!(req.plan.currency, "USD");
        assert_eq!(req.operating_system, "Ubuntu 22.04 LTS");
    }

    #[test]
    fn failure_event_type_depends_on_action() {
        let failed = |action: &str| {
            Notification::Failed(OperationFailed {
                instance_id: Uuid::nil(),
                owner_id: "u1".to_string(),
                action: action.to_string(),
                error_kind: ErrorKind::TaskTimeout,
                message: "timeout".to_string(),
            })
        };
        assert_eq!(
            failed("provision").event_type(),
            NotificationType::ProvisioningFailed
        );
        assert_eq!(failed("delete").event_type(), NotificationType::LifecycleFailed);
    }
}
