use super::{InstanceRepository, RepositoryError};
use async_trait::async_trait;
use cloudvps_common::{FailureInfo, Instance, InstancePatch, InstanceStatus, Pricing, ResourceSpec};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../sql/vps_instances.sql");

const COLUMNS: &str = "id, owner_id, name, plan, vmid, node, status, operating_system, \
     ip_address, private_ip_address, spec, pricing, next_billing_at, root_password, failure, \
     created_at, updated_at, deleted_at";

pub async fn create_pool(database_url: &str) -> Result<Pool<Postgres>, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

/// Postgres-backed repository using runtime-checked queries (no DATABASE_URL at build time).
#[derive(Clone)]
pub struct PgInstanceRepository {
    db: Pool<Postgres>,
}

impl PgInstanceRepository {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    /// Create the table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        for statement in SCHEMA
            .split(';')
            .map(strip_comments)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(&statement).execute(&self.db).await?;
        }
        Ok(())
    }

}

fn vmid_column(id: Uuid, vmid: u32) -> Result<i32, RepositoryError> {
    i32::try_from(vmid).map_err(|_| RepositoryError::VmidOutOfRange { id, vmid })
}

/// Only patched columns are written; `CASE` flags carry `Some(None)` (clear).
fn update_sql() -> String {
    format!(
        "UPDATE vps_instances
         SET status = COALESCE($2, status),
             vmid = COALESCE($3, vmid),
             node = COALESCE($4, node),
             ip_address = CASE WHEN $5 THEN $6 ELSE ip_address END,
             private_ip_address = CASE WHEN $7 THEN $8 ELSE private_ip_address END,
             root_password = CASE WHEN $9 THEN $10 ELSE root_password END,
             failure = CASE WHEN $11 THEN $12 ELSE failure END,
             updated_at = NOW()
         WHERE id = $1 AND deleted_at IS NULL AND status <> 'deleted'
         RETURNING {}",
        COLUMNS
    )
}

fn strip_comments(chunk: &str) -> String {
    chunk
        .lines()
        .filter(|l| !l.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn from_row(row: &PgRow) -> Result<Instance, RepositoryError> {
    let id: Uuid = row.try_get("id")?;
    let corrupt = |reason: String| RepositoryError::Corrupt { id, reason };

    let status: String = row.try_get("status")?;
    let status: InstanceStatus = status.parse().map_err(|e| corrupt(format!("{}", e)))?;
    let vmid: i32 = row.try_get("vmid")?;
    let vmid = u32::try_from(vmid).map_err(|_| corrupt(format!("negative vmid {}", vmid)))?;
    let Json(spec): Json<ResourceSpec> = row.try_get("spec")?;
    let Json(pricing): Json<Pricing> = row.try_get("pricing")?;
    let failure: Option<Json<FailureInfo>> = row.try_get("failure")?;

    Ok(Instance {
        id,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        plan: row.try_get("plan")?,
        vmid,
        node: row.try_get("node")?,
        status,
        operating_system: row.try_get("operating_system")?,
        ip_address: row.try_get("ip_address")?,
        private_ip_address: row.try_get("private_ip_address")?,
        spec,
        pricing,
        next_billing_at: row.try_get("next_billing_at")?,
        root_password: row.try_get("root_password")?,
        failure: failure.map(|Json(f)| f),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

#[async_trait]
impl InstanceRepository for PgInstanceRepository {
    async fn create(&self, inst: Instance) -> Result<Instance, RepositoryError> {
        let res = sqlx::query(&format!(
            "INSERT INTO vps_instances ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
             ON CONFLICT (id) DO NOTHING",
            COLUMNS
        ))
        .bind(inst.id)
        .bind(&inst.owner_id)
        .bind(&inst.name)
        .bind(&inst.plan)
        .bind(vmid_column(inst.id, inst.vmid)?)
        .bind(&inst.node)
        .bind(inst.status.as_str())
        .bind(&inst.operating_system)
        .bind(&inst.ip_address)
        .bind(&inst.private_ip_address)
        .bind(Json(inst.spec))
        .bind(Json(inst.pricing.clone()))
        .bind(inst.next_billing_at)
        .bind(&inst.root_password)
        .bind(inst.failure.clone().map(Json))
        .bind(inst.created_at)
        .bind(inst.updated_at)
        .bind(inst.deleted_at)
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            return Err(RepositoryError::Duplicate(inst.id));
        }
        Ok(inst)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Instance>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM vps_instances WHERE id = $1", COLUMNS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Instance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM vps_instances
             WHERE owner_id = $1 AND deleted_at IS NULL AND status <> 'deleted'
             ORDER BY created_at ASC",
            COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(from_row).collect()
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<Instance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM vps_instances WHERE status = $1 ORDER BY created_at ASC",
            COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(from_row).collect()
    }

    async fn update(
        &self,
        id: Uuid,
        patch: InstancePatch,
    ) -> Result<Option<Instance>, RepositoryError> {
        let vmid = patch.vmid.map(|v| vmid_column(id, v)).transpose()?;
        let InstancePatch {
            status,
            node,
            ip_address,
            private_ip_address,
            root_password,
            failure,
            ..
        } = patch;

        let row = sqlx::query(&update_sql())
            .bind(id)
            .bind(status.map(|s| s.as_str()))
            .bind(vmid)
            .bind(node)
            .bind(ip_address.is_some())
            .bind(ip_address.flatten())
            .bind(private_ip_address.is_some())
            .bind(private_ip_address.flatten())
            .bind(root_password.is_some())
            .bind(root_password.flatten())
            .bind(failure.is_some())
            .bind(failure.flatten().map(Json))
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let res = sqlx::query(
            "UPDATE vps_instances
             SET status = 'deleted',
                 deleted_at = COALESCE(deleted_at, NOW()),
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }
}
