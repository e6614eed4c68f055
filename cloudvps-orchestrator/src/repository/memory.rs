use super::{InstanceRepository, RepositoryError};
use async_trait::async_trait;
use chrono::Utc;
use cloudvps_common::{Instance, InstancePatch, InstanceStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local repository for tests and database-less runs.
#[derive(Default)]
pub struct InMemoryInstanceRepository {
    rows: RwLock<HashMap<Uuid, Instance>>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Instance> {
        let mut rows: Vec<Instance> = self.rows.read().await.values().cloned().collect();
        rows.sort_by_key(|i| i.created_at);
        rows
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn create(&self, instance: Instance) -> Result<Instance, RepositoryError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&instance.id) {
            return Err(RepositoryError::Duplicate(instance.id));
        }
        rows.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Instance>, RepositoryError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Instance>, RepositoryError> {
        let mut out: Vec<Instance> = self
            .rows
            .read()
            .await
            .values()
            .filter(|i| i.owner_id == owner_id && !i.is_deleted())
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        Ok(out)
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<Instance>, RepositoryError> {
        let mut out: Vec<Instance> = self
            .rows
            .read()
            .await
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        Ok(out)
    }

    async fn update(
        &self,
        id: Uuid,
        patch: InstancePatch,
    ) -> Result<Option<Instance>, RepositoryError> {
        let mut rows = self.rows.write().await;
        Ok(rows
            .get_mut(&id)
            .filter(|row| !row.is_deleted())
            .map(|row| {
                row.apply(patch);
                row.clone()
            }))
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        let now = Utc::now();
        row.status = InstanceStatus::Deleted;
        row.deleted_at.get_or_insert(now);
        row.updated_at = now;
        Ok(true)
    }
}
