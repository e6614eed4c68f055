use async_trait::async_trait;
use cloudvps_common::{ErrorKind, Instance, InstancePatch, InstanceStatus};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::InMemoryInstanceRepository;
pub use postgres::{create_pool, PgInstanceRepository};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("instance {0} already exists")]
    Duplicate(Uuid),
    #[error("stored instance {id} is unreadable: {reason}")]
    Corrupt { id: Uuid, reason: String },
    #[error("vmid {vmid} of instance {id} does not fit the vmid column")]
    VmidOutOfRange { id: Uuid, vmid: u32 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Repository
    }
}

/// Persistence of [`Instance`] records.
///
/// Read-then-write sequences are not atomic; the last writer wins.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create(&self, instance: Instance) -> Result<Instance, RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<Instance>, RepositoryError>;

    /// Every non-deleted instance of an owner, oldest first.
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Instance>, RepositoryError>;

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<Instance>, RepositoryError>;

    /// Apply `patch` and return the updated record. None when the id is unknown
    /// or the record is soft-deleted; deleted records are never rewritten.
    async fn update(
        &self,
        id: Uuid,
        patch: InstancePatch,
    ) -> Result<Option<Instance>, RepositoryError>;

    /// Mark deleted (status and `deleted_at`). False when the id is unknown.
    async fn soft_delete(&self, id: Uuid) -> Result<bool, RepositoryError>;
}
