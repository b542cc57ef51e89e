use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;
use vm_hypervisor::RemoteVmId;

/// Lifecycle status of a VM record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Provisioning,
    Running,
    Stopped,
    Suspended,
    Failed,
    Rebuilding,
    Deleting,
}

/// CPU, memory and disk sizing of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

/// Template a VM is cloned from, with its minimum requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub remote_id: RemoteVmId,
    pub name: String,
    /// OS family hint (`ubuntu`, `debian`, `windows`, ...). Guessed from the name when absent.
    #[serde(default)]
    pub os_hint: Option<String>,
    #[serde(default)]
    pub min_cpu_cores: u32,
    #[serde(default)]
    pub min_memory_bytes: u64,
    #[serde(default)]
    pub min_disk_bytes: u64,
}

impl TemplateRef {
    pub fn check(&self, spec: &ResourceSpec) -> Result<()> {
        if spec.cpu_cores == 0 || spec.memory_bytes == 0 || spec.disk_bytes == 0 {
            return Err(OrchestratorError::InvalidInput(
                "CPU, memory and disk must all be non-zero".to_string(),
            ));
        }
        if spec.cpu_cores < self.min_cpu_cores
            || spec.memory_bytes < self.min_memory_bytes
            || spec.disk_bytes < self.min_disk_bytes
        {
            return Err(OrchestratorError::InvalidInput(format!(
                "Requested resources are below the minimum for template {}",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub remote_vm_id: Option<RemoteVmId>,
    pub template_id: Option<RemoteVmId>,
    pub template_name: Option<String>,
    pub os_hint: Option<String>,
    pub resources: ResourceSpec,
    pub status: VmStatus,
    pub last_task: Option<String>,
    pub in_progress: bool,
    pub installed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVm {
    pub name: String,
    pub owner: String,
    pub template: TemplateRef,
    pub resources: ResourceSpec,
    /// Pre-assigned remote id; allocated by the cluster at clone time when absent.
    pub remote_vm_id: Option<RemoteVmId>,
}

#[derive(Debug, Clone, Default)]
pub struct VmFilters {
    pub owner: Option<String>,
    pub status: Option<VmStatus>,
}

/// Persistence for VM records.
#[derive(Clone)]
pub struct VmStore {
    pool: SqlitePool,
}

impl VmStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, vm: NewVm) -> Result<VmRecord> {
        vm.template.check(&vm.resources)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO vms (id, name, owner, remote_vm_id, template_id, template_name, os_hint,
                             cpu_cores, memory_bytes, disk_bytes, status, in_progress, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&vm.name)
        .bind(&vm.owner)
        .bind(vm.remote_vm_id.map(i64::from))
        .bind(i64::from(vm.template.remote_id))
        .bind(&vm.template.name)
        .bind(&vm.template.os_hint)
        .bind(i64::from(vm.resources.cpu_cores))
        .bind(to_i64(vm.resources.memory_bytes))
        .bind(to_i64(vm.resources.disk_bytes))
        .bind(VmStatus::Provisioning)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<VmRecord> {
        let row = sqlx::query_as::<_, VmRow>("SELECT * FROM vms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("VM {id}")))?;

        Ok(row.into())
    }

    /// List VM records with optional filters
    pub async fn list(&self, filters: VmFilters) -> Result<Vec<VmRecord>> {
        let mut query = "SELECT * FROM vms WHERE 1=1".to_string();

        if filters.owner.is_some() {
            query.push_str(" AND owner = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, VmRow>(&query);

        if let Some(owner) = &filters.owner {
            q = q.bind(owner);
        }
        if let Some(status) = &filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Mark an operation as started, optionally moving to a transitional status.
    pub async fn begin_operation(&self, id: &str, status: Option<VmStatus>) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE vms SET in_progress = 1, status = COALESCE(?, status), last_error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear the in-progress flag and settle on `status`.
    pub async fn finish_operation(&self, id: &str, status: VmStatus) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE vms SET in_progress = 0, status = ?, last_error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear the in-progress flag after a failure. `status` of `None` keeps the current status.
    pub async fn fail_operation(&self, id: &str, status: Option<VmStatus>, error: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE vms SET in_progress = 0, status = COALESCE(?, status), last_error = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_installed(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE vms SET status = ?, in_progress = 0, installed_at = ?, last_error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(VmStatus::Running)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: VmStatus) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE vms SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_remote_id(&self, id: &str, remote_vm_id: RemoteVmId) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE vms SET remote_vm_id = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(remote_vm_id))
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_task(&self, id: &str, task: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE vms SET last_task = ?, updated_at = ? WHERE id = ?")
            .bind(task)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record resource values the remote system has confirmed. Fields passed as
    /// `None` are left unchanged.
    pub async fn record_confirmed_resources(
        &self,
        id: &str,
        cpu_cores: Option<u32>,
        memory_bytes: Option<u64>,
        disk_bytes: Option<u64>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE vms
             SET cpu_cores = COALESCE(?, cpu_cores),
                 memory_bytes = COALESCE(?, memory_bytes),
                 disk_bytes = COALESCE(?, disk_bytes),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(cpu_cores.map(i64::from))
        .bind(memory_bytes.map(to_i64))
        .bind(disk_bytes.map(to_i64))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM vms WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("VM {id}")));
        }

        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn remote_id(value: Option<i64>) -> Option<RemoteVmId> {
    value.and_then(|v| RemoteVmId::try_from(v).ok())
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct VmRow {
    id: String,
    name: String,
    owner: String,
    remote_vm_id: Option<i64>,
    template_id: Option<i64>,
    template_name: Option<String>,
    os_hint: Option<String>,
    cpu_cores: i64,
    memory_bytes: i64,
    disk_bytes: i64,
    status: VmStatus,
    last_task: Option<String>,
    in_progress: bool,
    installed_at: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<VmRow> for VmRecord {
    fn from(row: VmRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            owner: row.owner,
            remote_vm_id: remote_id(row.remote_vm_id),
            template_id: remote_id(row.template_id),
            template_name: row.template_name,
            os_hint: row.os_hint,
            resources: ResourceSpec {
                cpu_cores: u32::try_from(row.cpu_cores).unwrap_or_default(),
                memory_bytes: from_i64(row.memory_bytes),
                disk_bytes: from_i64(row.disk_bytes),
            },
            status: row.status,
            last_task: row.last_task,
            in_progress: row.in_progress,
            installed_at: row.installed_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            last_error: row.last_error,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}
