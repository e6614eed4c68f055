use async_trait::async_trait;
use cloudvps_common::{Instance, InstanceStatus};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repository::{InstanceRepository, RepositoryError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpAssignment {
    pub public: String,
    pub private: Option<String>,
}

/// Address management collaborator. `assign` returns None while no address is
/// available yet; the workflow keeps asking until its wait bound elapses.
#[async_trait]
pub trait IpAllocator: Send + Sync {
    async fn assign(&self, instance: &Instance) -> Option<IpAssignment>;

    async fn release(&self, _instance_id: Uuid) {}
}

/// Hands out `prefix + host` addresses (host 2..=254) from two fixed /24 pools.
/// The same instance always gets the same pair back.
pub struct StaticPoolIpAllocator {
    public_prefix: String,
    private_prefix: String,
    leases: Mutex<HashMap<Uuid, u8>>,
}

const FIRST_HOST: u8 = 2;
const LAST_HOST: u8 = 254;

impl StaticPoolIpAllocator {
    pub fn new(public_prefix: impl Into<String>, private_prefix: impl Into<String>) -> Self {
        Self {
            public_prefix: public_prefix.into(),
            private_prefix: private_prefix.into(),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Take back the addresses live instances already hold, so a restarted
    /// process does not hand them out twice. Returns the number of leases.
    pub async fn restore(&self, repo: &dyn InstanceRepository) -> Result<usize, RepositoryError> {
        let mut leases = self.leases.lock().await;
        for status in [
            InstanceStatus::Creating,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Suspended,
            InstanceStatus::Failed,
        ] {
            for inst in repo.list_by_status(status).await? {
                if let Some(host) = self.host_of(inst.ip_address.as_deref()) {
                    leases.insert(inst.id, host);
                }
            }
        }
        Ok(leases.len())
    }

    fn host_of(&self, ip: Option<&str>) -> Option<u8> {
        ip?.strip_prefix(self.public_prefix.as_str())?
            .parse::<u8>()
            .ok()
            .filter(|h| (FIRST_HOST..=LAST_HOST).contains(h))
    }

    fn pair(&self, host: u8) -> IpAssignment {
        IpAssignment {
            public: format!("{}{}", self.public_prefix, host),
            private: Some(format!("{}{}", self.private_prefix, host)),
        }
    }
}

#[async_trait]
impl IpAllocator for StaticPoolIpAllocator {
    async fn assign(&self, instance: &Instance) -> Option<IpAssignment> {
        let mut leases = self.leases.lock().await;
        if let Some(host) = leases.get(&instance.id) {
            return Some(self.pair(*host));
        }
        let host = (FIRST_HOST..=LAST_HOST).find(|h| !leases.values().any(|used| used == h))?;
        leases.insert(instance.id, host);
        tracing::debug!(
            "[ip_allocator] instance {} gets host .{}",
            instance.id,
            host
        );
        Some(self.pair(host))
    }

    async fn release(&self, instance_id: Uuid) {
        self.leases.lock().await.remove(&instance_id);
    }
}
