use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::guest_init::{GuestCredentials, NetworkAddress};
use crate::vm::{ResourceSpec, VmStatus};
use crate::workflow::{RunKind, StepKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Steps only move forward: pending → running → completed | failed | skipped.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
                | (StepStatus::Running, StepStatus::Skipped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Inputs a workflow needs beyond the VM record itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub target: ResourceSpec,
    #[serde(default)]
    pub credentials: Option<GuestCredentials>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub address: Option<NetworkAddress>,
    #[serde(default = "default_disk_key")]
    pub disk_key: String,
}

pub fn default_disk_key() -> String {
    "scsi0".to_string()
}

impl RunParams {
    pub fn for_target(target: ResourceSpec) -> Self {
        Self {
            target,
            credentials: None,
            ssh_keys: Vec::new(),
            address: None,
            disk_key: default_disk_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub vm_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub params: RunParams,
    /// VM status when the run was enqueued.
    pub prior_status: Option<VmStatus>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub run_id: String,
    pub position: u32,
    pub name: StepKind,
    pub status: StepStatus,
    pub attempts: u32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub steps: Vec<RunStep>,
}

/// Persistence for runs and their steps. The `run_steps` table is the single
/// source of truth for orchestration progress.
#[derive(Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a pending run with all of its steps. Fails with `InvalidState`
    /// if the VM already has an active run.
    pub async fn create(
        &self,
        vm_id: &str,
        kind: RunKind,
        params: &RunParams,
        prior_status: VmStatus,
    ) -> Result<Run> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let params_json = serde_json::to_string(params)?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO runs (id, vm_id, kind, status, params, prior_status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(vm_id)
        .bind(kind)
        .bind(RunStatus::Pending)
        .bind(&params_json)
        .bind(prior_status)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            let unique_violation = err
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            if unique_violation {
                return Err(OrchestratorError::InvalidState(format!(
                    "VM {vm_id} already has an active run"
                )));
            }
            return Err(err.into());
        }

        for (position, step) in kind.steps().iter().enumerate() {
            sqlx::query(
                "INSERT INTO run_steps (run_id, position, name, status, attempts)
                 VALUES (?, ?, ?, ?, 0)",
            )
            .bind(&id)
            .bind(position as i64)
            .bind(step)
            .bind(StepStatus::Pending)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Run {id}")))?;

        row.try_into()
    }

    pub async fn get_detail(&self, id: &str) -> Result<RunDetail> {
        let run = self.get(id).await?;
        let steps = self.steps(id).await?;
        Ok(RunDetail { run, steps })
    }

    pub async fn steps(&self, run_id: &str) -> Result<Vec<RunStep>> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM run_steps WHERE run_id = ? ORDER BY position",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    pub async fn step(&self, run_id: &str, position: u32) -> Result<RunStep> {
        let row = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM run_steps WHERE run_id = ? AND position = ?",
        )
        .bind(run_id)
        .bind(i64::from(position))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("Step {position} of run {run_id}")))?;

        Ok(row.into())
    }

    /// Get all runs with optional filters
    pub async fn list(&self, vm_id: Option<&str>, status: Option<RunStatus>) -> Result<Vec<Run>> {
        let mut query = "SELECT * FROM runs WHERE 1=1".to_string();

        if vm_id.is_some() {
            query.push_str(" AND vm_id = ?");
        }
        if status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut q = sqlx::query_as::<_, RunRow>(&query);

        if let Some(vm_id) = vm_id {
            q = q.bind(vm_id);
        }
        if let Some(status) = status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    /// Pending runs, oldest first.
    pub async fn pending(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE status = ? ORDER BY created_at, rowid",
        )
        .bind(RunStatus::Pending)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    pub async fn latest_for_vm(&self, vm_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE vm_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(vm_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    pub async fn active_for_vm(&self, vm_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE vm_id = ? AND status IN ('pending', 'running') LIMIT 1",
        )
        .bind(vm_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    /// Move a pending run to running. Returns false if another worker got there first.
    pub async fn claim(&self, run_id: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE runs SET status = ?, started_at = ? WHERE id = ? AND status = ?",
        )
        .bind(RunStatus::Running)
        .bind(now)
        .bind(run_id)
        .bind(RunStatus::Pending)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn complete_run(&self, run_id: &str) -> Result<()> {
        self.finish_run(run_id, RunStatus::Completed, None).await
    }

    pub async fn fail_run(&self, run_id: &str, error: &str) -> Result<()> {
        self.finish_run(run_id, RunStatus::Failed, Some(error)).await
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> Result<()> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE runs SET status = ?, error = ?, completed_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(status)
        .bind(error)
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "Run {run_id} is already finished"
            )));
        }
        Ok(())
    }

    /// pending → running. Returns false if the step was not pending.
    pub async fn start_step(&self, run_id: &str, position: u32) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE run_steps SET status = ?, started_at = ?
             WHERE run_id = ? AND position = ? AND status = ?",
        )
        .bind(StepStatus::Running)
        .bind(now)
        .bind(run_id)
        .bind(i64::from(position))
        .bind(StepStatus::Pending)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Count one more attempt of a running step and return the new count.
    pub async fn record_attempt(&self, run_id: &str, position: u32) -> Result<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE run_steps SET attempts = attempts + 1
             WHERE run_id = ? AND position = ? AND status = ?
             RETURNING attempts",
        )
        .bind(run_id)
        .bind(i64::from(position))
        .bind(StepStatus::Running)
        .fetch_optional(&self.pool)
        .await?;

        attempts
            .map(|a| u32::try_from(a).unwrap_or(u32::MAX))
            .ok_or_else(|| {
                OrchestratorError::InvalidState(format!(
                    "Step {position} of run {run_id} is not running"
                ))
            })
    }

    /// Keep the latest error of a step that will be retried.
    pub async fn note_step_error(&self, run_id: &str, position: u32, error: &str) -> Result<()> {
        sqlx::query("UPDATE run_steps SET error = ? WHERE run_id = ? AND position = ? AND status = ?")
            .bind(error)
            .bind(run_id)
            .bind(i64::from(position))
            .bind(StepStatus::Running)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_step(&self, run_id: &str, position: u32, output: Option<&str>) -> Result<()> {
        self.finish_step(run_id, position, StepStatus::Completed, output, None)
            .await
    }

    pub async fn skip_step(&self, run_id: &str, position: u32, reason: &str) -> Result<()> {
        self.finish_step(run_id, position, StepStatus::Skipped, Some(reason), None)
            .await
    }

    pub async fn fail_step(&self, run_id: &str, position: u32, error: &str) -> Result<()> {
        self.finish_step(run_id, position, StepStatus::Failed, None, Some(error))
            .await
    }

    async fn finish_step(
        &self,
        run_id: &str,
        position: u32,
        status: StepStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(StepStatus::Running.can_transition_to(status));

        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE run_steps
             SET status = ?, output = COALESCE(?, output), error = ?, completed_at = ?
             WHERE run_id = ? AND position = ? AND status = ?",
        )
        .bind(status)
        .bind(output)
        .bind(error)
        .bind(now)
        .bind(run_id)
        .bind(i64::from(position))
        .bind(StepStatus::Running)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "Step {position} of run {run_id} is not running"
            )));
        }
        Ok(())
    }

    /// Running runs that no longer hold a live lease on their VM.
    pub async fn orphaned(&self) -> Result<Vec<Run>> {
        let now = Utc::now().timestamp();
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT r.* FROM runs r
             LEFT JOIN vm_leases l
               ON l.vm_id = r.vm_id AND l.owner = 'run:' || r.id AND l.expires_at > ?
             WHERE r.status = ? AND l.vm_id IS NULL",
        )
        .bind(now)
        .bind(RunStatus::Running)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    vm_id: String,
    kind: RunKind,
    status: RunStatus,
    params: String,
    prior_status: Option<VmStatus>,
    error: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct StepRow {
    run_id: String,
    position: i64,
    name: StepKind,
    status: StepStatus,
    attempts: i64,
    output: Option<String>,
    error: Option<String>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<RunRow> for Run {
    type Error = OrchestratorError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            vm_id: row.vm_id,
            kind: row.kind,
            status: row.status,
            params: serde_json::from_str(&row.params)?,
            prior_status: row.prior_status,
            error: row.error,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            started_at: row.started_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            completed_at: row.completed_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }
}

impl From<StepRow> for RunStep {
    fn from(row: StepRow) -> Self {
        Self {
            run_id: row.run_id,
            position: u32::try_from(row.position).unwrap_or_default(),
            name: row.name,
            status: row.status,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            output: row.output,
            error: row.error,
            started_at: row.started_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            completed_at: row.completed_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        }
    }
}
