//! Entry point for callers: VM records, run enqueueing and manual operations.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use vm_hypervisor::{Gateway, PowerAction, RemoteVmId};

use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::guest_init::{GuestCredentials, NetworkAddress};
use crate::keys::{SshKey, SshKeyStore};
use crate::lease::{manual_owner, LeaseStore};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::run::{default_disk_key, Run, RunDetail, RunParams, RunStatus, RunStore};
use crate::sequencer::Sequencer;
use crate::steps::status_after_power;
use crate::task_monitor::TaskMonitor;
use crate::throttle::ThrottledGateway;
use crate::vm::{NewVm, ResourceSpec, TemplateRef, VmFilters, VmRecord, VmStatus, VmStore};
use crate::workflow::RunKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    /// Set by the caller from the authenticated user.
    #[serde(default)]
    pub owner: String,
    pub template: TemplateRef,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub credentials: Option<GuestCredentials>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub address: Option<NetworkAddress>,
    #[serde(default = "default_disk_key")]
    pub disk_key: String,
    #[serde(default)]
    pub remote_vm_id: Option<RemoteVmId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildRequest {
    /// Defaults to the VM's current resources.
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub credentials: Option<GuestCredentials>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub address: Option<NetworkAddress>,
    #[serde(default)]
    pub disk_key: Option<String>,
}

/// What the janitor cleaned up in one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub orphaned_runs: usize,
    pub expired_leases: u64,
}

/// Orchestrates VM lifecycles against one cluster.
#[derive(Clone)]
pub struct VmOrchestrator {
    pool: SqlitePool,
    gateway: Arc<dyn Gateway>,
    vms: VmStore,
    runs: RunStore,
    leases: LeaseStore,
    keys: SshKeyStore,
    progress: ProgressTracker,
    sequencer: Arc<Sequencer>,
    config: EngineConfig,
}

impl VmOrchestrator {
    pub fn new(pool: SqlitePool, gateway: Arc<dyn Gateway>, config: EngineConfig) -> Self {
        let gateway: Arc<dyn Gateway> =
            Arc::new(ThrottledGateway::new(gateway, config.max_remote_calls));
        let vms = VmStore::new(pool.clone());
        let runs = RunStore::new(pool.clone());
        let leases = LeaseStore::new(pool.clone());
        let keys = SshKeyStore::new(pool.clone());
        let progress = ProgressTracker::new(runs.clone(), config.progress_ttl());
        let sequencer = Arc::new(Sequencer::new(
            gateway.clone(),
            runs.clone(),
            vms.clone(),
            leases.clone(),
            keys.clone(),
            progress.clone(),
            config.clone(),
        ));

        Self {
            pool,
            gateway,
            vms,
            runs,
            leases,
            keys,
            progress,
            sequencer,
            config,
        }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn sequencer(&self) -> Arc<Sequencer> {
        self.sequencer.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create the VM record and enqueue its build.
    #[instrument(skip(self, req), fields(name = %req.name, owner = %req.owner))]
    pub async fn create_vm(&self, req: CreateVmRequest) -> Result<(VmRecord, Run)> {
        if req.name.trim().is_empty() || req.owner.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "VM name and owner must not be empty".to_string(),
            ));
        }
        if let Some(address) = &req.address {
            address.validate()?;
        }
        if let Some(remote) = req.remote_vm_id {
            match self.gateway.vm_config(remote).await {
                Ok(_) => {
                    return Err(OrchestratorError::InvalidState(format!(
                        "Remote VM {remote} already exists"
                    )));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let vm = self
            .vms
            .insert(NewVm {
                name: req.name,
                owner: req.owner,
                template: req.template,
                resources: req.resources,
                remote_vm_id: req.remote_vm_id,
            })
            .await?;

        let params = RunParams {
            target: req.resources,
            credentials: req.credentials,
            ssh_keys: req.ssh_keys,
            address: req.address,
            disk_key: req.disk_key,
        };
        let run = self
            .runs
            .create(&vm.id, RunKind::Build, &params, VmStatus::Provisioning)
            .await?;
        self.progress.refresh(&vm.id).await?;

        info!(vm_id = %vm.id, run_id = %run.id, "VM created, build enqueued");
        Ok((vm, run))
    }

    /// Destroy the remote VM and clone it again from its template.
    #[instrument(skip(self, req))]
    pub async fn rebuild(&self, vm_id: &str, req: RebuildRequest) -> Result<Run> {
        let vm = self.vms.get(vm_id).await?;
        if let Some(address) = &req.address {
            address.validate()?;
        }
        let target = req.resources.unwrap_or(vm.resources);
        if target.cpu_cores == 0 || target.memory_bytes == 0 || target.disk_bytes == 0 {
            return Err(OrchestratorError::InvalidInput(
                "CPU, memory and disk must all be non-zero".to_string(),
            ));
        }

        let params = RunParams {
            target,
            credentials: req.credentials,
            ssh_keys: req.ssh_keys,
            address: req.address,
            disk_key: req.disk_key.unwrap_or_else(default_disk_key),
        };
        self.enqueue(&vm, RunKind::Rebuild, params).await
    }

    /// Change CPU, memory and disk size in place.
    #[instrument(skip(self))]
    pub async fn resize(&self, vm_id: &str, target: ResourceSpec) -> Result<Run> {
        let vm = self.vms.get(vm_id).await?;
        if vm.remote_vm_id.is_none() {
            return Err(OrchestratorError::InvalidState(format!(
                "VM {vm_id} has not been provisioned yet"
            )));
        }
        if target.cpu_cores == 0 || target.memory_bytes == 0 || target.disk_bytes == 0 {
            return Err(OrchestratorError::InvalidInput(
                "CPU, memory and disk must all be non-zero".to_string(),
            ));
        }
        if target.disk_bytes < vm.resources.disk_bytes {
            return Err(OrchestratorError::InvalidInput(
                "Disks can only grow".to_string(),
            ));
        }

        self.enqueue(&vm, RunKind::Resize, RunParams::for_target(target))
            .await
    }

    /// Power off and destroy the remote VM, then remove the record.
    #[instrument(skip(self))]
    pub async fn delete(&self, vm_id: &str) -> Result<Run> {
        let vm = self.vms.get(vm_id).await?;
        self.enqueue(&vm, RunKind::Delete, RunParams::for_target(vm.resources))
            .await
    }

    async fn enqueue(&self, vm: &VmRecord, kind: RunKind, params: RunParams) -> Result<Run> {
        if let Some(lease) = self.leases.current(&vm.id).await? {
            return Err(OrchestratorError::LeaseHeld {
                vm_id: vm.id.clone(),
                owner: lease.owner,
            });
        }

        let run = self.runs.create(&vm.id, kind, &params, vm.status).await?;
        self.progress.refresh(&vm.id).await?;
        info!(vm_id = %vm.id, run_id = %run.id, kind = kind.as_str(), "Run enqueued");
        Ok(run)
    }

    /// Manual power action outside any run. Rejected while the VM is leased
    /// or has an active run.
    #[instrument(skip(self))]
    pub async fn power(&self, vm_id: &str, actor: &str, action: PowerAction) -> Result<VmRecord> {
        let vm = self.vms.get(vm_id).await?;
        let remote = vm.remote_vm_id.ok_or_else(|| {
            OrchestratorError::InvalidState(format!("VM {vm_id} has not been provisioned yet"))
        })?;

        let owner = manual_owner(actor);
        let timeout = Duration::from_secs(self.config.power_timeout_secs);
        self.leases
            .acquire(vm_id, &owner, timeout + Duration::from_secs(30))
            .await?;

        let result = self.power_leased(&vm, remote, action, timeout).await;

        if let Err(e) = self.leases.release(vm_id, &owner).await {
            warn!(error = %e, "Could not release power lease");
        }
        result
    }

    async fn power_leased(
        &self,
        vm: &VmRecord,
        remote: RemoteVmId,
        action: PowerAction,
        timeout: Duration,
    ) -> Result<VmRecord> {
        if let Some(run) = self.runs.active_for_vm(&vm.id).await? {
            return Err(OrchestratorError::InvalidState(format!(
                "VM {} has an active {} run ({})",
                vm.id,
                run.kind.as_str(),
                run.id
            )));
        }

        match self.gateway.power(remote, action).await {
            Ok(task) => {
                self.vms.set_last_task(&vm.id, task.as_str()).await?;
                TaskMonitor::new(self.gateway.clone(), self.config.task_poll_interval())
                    .wait_for_task(&task, timeout)
                    .await?;
            }
            Err(e) if e.is_already_satisfied() => {
                info!(action = action.as_str(), "VM already in requested power state");
            }
            Err(e) => return Err(e.into()),
        }

        self.vms.set_status(&vm.id, status_after_power(action)).await?;
        info!(vm_id = %vm.id, action = action.as_str(), "Power action completed");
        self.vms.get(&vm.id).await
    }

    pub async fn get_vm(&self, vm_id: &str) -> Result<VmRecord> {
        self.vms.get(vm_id).await
    }

    pub async fn list_vms(&self, filters: VmFilters) -> Result<Vec<VmRecord>> {
        self.vms.list(filters).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunDetail> {
        self.runs.get_detail(run_id).await
    }

    pub async fn list_runs(
        &self,
        vm_id: Option<&str>,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>> {
        self.runs.list(vm_id, status).await
    }

    /// Current step and percentage of the VM's latest run.
    pub async fn progress(&self, vm_id: &str) -> Result<Option<ProgressSnapshot>> {
        self.vms.get(vm_id).await?;
        self.progress.get(vm_id).await
    }

    pub async fn add_ssh_key(&self, owner: &str, name: &str, public_key: &str) -> Result<SshKey> {
        self.keys.add(owner, name, public_key).await
    }

    pub async fn list_ssh_keys(&self, owner: &str) -> Result<Vec<SshKey>> {
        self.keys.list_for_owner(owner).await
    }

    pub async fn delete_ssh_key(&self, owner: &str, id: &str) -> Result<()> {
        self.keys.delete(owner, id).await
    }

    /// Fail runs whose worker disappeared and drop expired leases.
    pub async fn janitor_sweep(&self) -> Result<SweepReport> {
        let orphans = self.runs.orphaned().await?;
        for run in &orphans {
            self.sequencer
                .abort(&run.id, "Run lease expired without progress")
                .await?;
        }
        let expired_leases = self.leases.purge_expired().await?;

        if !orphans.is_empty() || expired_leases > 0 {
            info!(
                orphaned_runs = orphans.len(),
                expired_leases, "Janitor sweep cleaned up"
            );
        }
        Ok(SweepReport {
            orphaned_runs: orphans.len(),
            expired_leases,
        })
    }
}
