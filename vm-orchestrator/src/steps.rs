//! Bodies of the individual workflow steps.
//!
//! Each step is written so a repeat after a crash or retry converges on the
//! same remote state: power actions accept "already" answers, removal steps
//! accept "does not exist", and cloning reuses a VM that already exists.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use vm_hypervisor::{CloneOptions, Gateway, PowerAction, RemoteVmId, TaskHandle};

use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::guest_init::{default_username, merge_ssh_keys, GuestInitConfigurator, GuestInitRequest};
use crate::keys::SshKeyStore;
use crate::lock_wait::LockWaiter;
use crate::progress::ProgressTracker;
use crate::resources::ResourceConfigurator;
use crate::run::Run;
use crate::task_monitor::TaskMonitor;
use crate::vm::{VmRecord, VmStatus, VmStore};
use crate::workflow::{RunKind, StepKind};

/// How a step body ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Done(String),
    Skipped(String),
}

#[derive(Clone)]
pub struct StepRunner {
    gateway: Arc<dyn Gateway>,
    vms: VmStore,
    keys: SshKeyStore,
    progress: ProgressTracker,
    monitor: TaskMonitor,
    locks: LockWaiter,
    resources: ResourceConfigurator,
    guest_init: GuestInitConfigurator,
    config: EngineConfig,
}

fn remote_id(vm: &VmRecord) -> Result<RemoteVmId> {
    vm.remote_vm_id.ok_or_else(|| {
        OrchestratorError::InvalidState(format!("VM {} has no remote id yet", vm.id))
    })
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

impl StepRunner {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        vms: VmStore,
        keys: SshKeyStore,
        progress: ProgressTracker,
        config: EngineConfig,
    ) -> Self {
        Self {
            monitor: TaskMonitor::new(gateway.clone(), config.task_poll_interval()),
            locks: LockWaiter::new(
                gateway.clone(),
                config.lock_wait_attempts,
                config.lock_wait_interval(),
            ),
            resources: ResourceConfigurator::new(gateway.clone(), &config),
            guest_init: GuestInitConfigurator::new(gateway.clone(), &config),
            gateway,
            vms,
            keys,
            progress,
            config,
        }
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, vm_id = %run.vm_id))]
    pub async fn perform(&self, run: &Run, step: StepKind) -> Result<StepResult> {
        // The delete workflow's last step removes the record itself, so a
        // repeat must not require it to exist.
        if run.kind == RunKind::Delete && step == StepKind::Finalize {
            return self.remove_record(&run.vm_id).await;
        }

        let vm = self.vms.get(&run.vm_id).await?;

        match step {
            StepKind::Clone => self.clone_vm(run, &vm).await,
            StepKind::WaitUnlocked | StepKind::WaitCreated => {
                let remote = remote_id(&vm)?;
                self.locks.ensure_unlocked(remote).await?;
                Ok(StepResult::Done("unlocked".to_string()))
            }
            StepKind::ConfigureResources => self.configure_resources(run, &vm).await,
            StepKind::ResizeDisk => self.resize_disk(run, &vm).await,
            StepKind::ConfigureGuestInit => self.configure_guest_init(run, &vm).await,
            StepKind::ConfigureVm => self.configure_vm(run, &vm).await,
            StepKind::PowerOn => self.power_on(&vm).await,
            StepKind::PowerOff => self.power_off(&vm).await,
            StepKind::WaitStopped => self.wait_stopped(&vm).await,
            StepKind::Delete => self.delete_remote(&vm).await,
            StepKind::WaitDeleted => self.wait_deleted(&vm).await,
            StepKind::WaitAgentReachable => self.wait_agent(&vm).await,
            StepKind::MarkInstalled => {
                self.vms.mark_installed(&vm.id).await?;
                Ok(StepResult::Done("installed".to_string()))
            }
            StepKind::Finalize => self.finalize(run, &vm).await,
        }
    }

    async fn track_task(&self, vm: &VmRecord, task: &TaskHandle, timeout: Duration) -> Result<()> {
        self.vms.set_last_task(&vm.id, task.as_str()).await?;
        self.monitor.wait_for_task(task, timeout).await?;
        Ok(())
    }

    async fn clone_vm(&self, run: &Run, vm: &VmRecord) -> Result<StepResult> {
        let template = vm.template_id.ok_or_else(|| {
            OrchestratorError::InvalidState(format!("VM {} has no template", vm.id))
        })?;

        let new_id = match vm.remote_vm_id {
            Some(id) => {
                // A previous attempt may have dispatched the clone already.
                // Only a VM carrying our name is ours to adopt.
                match self.gateway.vm_config(id).await {
                    Ok(existing) if existing.get("name") == Some(vm.name.as_str()) => {
                        info!(remote_vm_id = id, "Remote VM already exists, not cloning again");
                        return Ok(StepResult::Done(format!("VM {id} already present")));
                    }
                    Ok(existing) => {
                        return Err(OrchestratorError::InvalidState(format!(
                            "Remote VM {id} belongs to {}, not {}",
                            existing.get("name").unwrap_or("an unnamed VM"),
                            vm.name
                        )));
                    }
                    Err(e) if e.is_not_found() => id,
                    Err(e) => return Err(e.into()),
                }
            }
            None => {
                let id = self.gateway.next_vm_id().await?;
                self.vms.set_remote_id(&vm.id, id).await?;
                id
            }
        };

        let options = CloneOptions {
            name: Some(vm.name.clone()),
            full: true,
            storage: None,
        };
        let task = self.gateway.clone_vm(template, new_id, &options).await?;
        self.vms.set_last_task(&vm.id, task.as_str()).await?;
        info!(template, remote_vm_id = new_id, task = %task, "Clone dispatched");

        let progress = self.progress.clone();
        let (vm_id, run_id) = (run.vm_id.clone(), run.id.clone());
        self.monitor
            .wait_with_progress(&task, secs(self.config.clone_timeout_secs), &move |percent: f64| {
                progress.report_step_percent(&vm_id, &run_id, percent)
            })
            .await?;

        Ok(StepResult::Done(task.to_string()))
    }

    async fn configure_resources(&self, run: &Run, vm: &VmRecord) -> Result<StepResult> {
        let remote = remote_id(vm)?;
        let target = &run.params.target;
        let confirmed = self
            .resources
            .apply_cpu_memory(remote, target.cpu_cores, target.memory_bytes)
            .await?;
        self.vms
            .record_confirmed_resources(&vm.id, confirmed.cpu_cores, confirmed.memory_bytes, None)
            .await?;
        Ok(StepResult::Done(serde_json::to_string(&confirmed)?))
    }

    async fn resize_disk(&self, run: &Run, vm: &VmRecord) -> Result<StepResult> {
        let remote = remote_id(vm)?;
        let report = self
            .resources
            .resize_disk(remote, &run.params.disk_key, run.params.target.disk_bytes)
            .await?;
        if report.confirmed_bytes.is_some() {
            self.vms
                .record_confirmed_resources(&vm.id, None, None, report.confirmed_bytes)
                .await?;
        }
        Ok(StepResult::Done(serde_json::to_string(&report)?))
    }

    async fn guest_init_request(&self, run: &Run, vm: &VmRecord) -> Result<GuestInitRequest> {
        let credentials = run.params.credentials.clone().unwrap_or_default();
        let username = credentials.username.unwrap_or_else(|| {
            default_username(vm.os_hint.as_deref(), vm.template_name.as_deref()).to_string()
        });

        let account_keys: Vec<String> = self
            .keys
            .list_for_owner(&vm.owner)
            .await?
            .into_iter()
            .map(|key| key.public_key)
            .collect();

        Ok(GuestInitRequest {
            username,
            password: credentials.password,
            ssh_keys: merge_ssh_keys(&run.params.ssh_keys, &account_keys),
            address: run.params.address.clone(),
        })
    }

    async fn configure_guest_init(&self, run: &Run, vm: &VmRecord) -> Result<StepResult> {
        let remote = remote_id(vm)?;
        let request = self.guest_init_request(run, vm).await?;
        let attempts = self.guest_init.apply(remote, &request).await?;
        Ok(StepResult::Done(format!(
            "user {} with {} key(s), applied on attempt {attempts}",
            request.username,
            request.ssh_keys.len()
        )))
    }

    async fn configure_vm(&self, run: &Run, vm: &VmRecord) -> Result<StepResult> {
        let remote = remote_id(vm)?;
        let (confirmed, disk) = self
            .resources
            .apply(remote, &run.params.target, &run.params.disk_key)
            .await?;
        self.vms
            .record_confirmed_resources(
                &vm.id,
                confirmed.cpu_cores,
                confirmed.memory_bytes,
                confirmed.disk_bytes,
            )
            .await?;

        self.locks.ensure_unlocked(remote).await?;
        let request = self.guest_init_request(run, vm).await?;
        let attempts = self.guest_init.apply(remote, &request).await?;

        Ok(StepResult::Done(serde_json::to_string(&serde_json::json!({
            "resources": confirmed,
            "disk": disk,
            "guest_init_attempts": attempts,
        }))?))
    }

    async fn power_on(&self, vm: &VmRecord) -> Result<StepResult> {
        let remote = remote_id(vm)?;
        match self.gateway.power(remote, PowerAction::Start).await {
            Ok(task) => {
                self.track_task(vm, &task, secs(self.config.power_timeout_secs))
                    .await?;
                Ok(StepResult::Done(task.to_string()))
            }
            Err(e) if e.is_already_satisfied() => Ok(StepResult::Done("already running".to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn power_off(&self, vm: &VmRecord) -> Result<StepResult> {
        let Some(remote) = vm.remote_vm_id else {
            return Ok(StepResult::Skipped("no remote VM".to_string()));
        };
        match self.gateway.power(remote, PowerAction::Stop).await {
            Ok(task) => {
                self.track_task(vm, &task, secs(self.config.power_timeout_secs))
                    .await?;
                Ok(StepResult::Done(task.to_string()))
            }
            Err(e) if e.is_already_satisfied() => Ok(StepResult::Done("already stopped".to_string())),
            Err(e) if e.is_not_found() => Ok(StepResult::Done("already absent".to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_stopped(&self, vm: &VmRecord) -> Result<StepResult> {
        let Some(remote) = vm.remote_vm_id else {
            return Ok(StepResult::Skipped("no remote VM".to_string()));
        };
        let attempts = self.config.state_wait_attempts.max(1);
        for attempt in 1..=attempts {
            match self.gateway.vm_status(remote).await {
                Ok(status) if status.is_stopped() => {
                    return Ok(StepResult::Done("stopped".to_string()))
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    return Ok(StepResult::Done("already absent".to_string()))
                }
                Err(e) => return Err(e.into()),
            }
            if attempt < attempts {
                sleep(self.config.state_wait_interval()).await;
            }
        }
        Err(OrchestratorError::WaitTimeout {
            vm: remote,
            condition: "stopped".to_string(),
        })
    }

    async fn delete_remote(&self, vm: &VmRecord) -> Result<StepResult> {
        let Some(remote) = vm.remote_vm_id else {
            return Ok(StepResult::Skipped("no remote VM".to_string()));
        };
        match self.gateway.delete_vm(remote).await {
            Ok(task) => {
                self.track_task(vm, &task, secs(self.config.delete_timeout_secs))
                    .await?;
                Ok(StepResult::Done(task.to_string()))
            }
            Err(e) if e.is_not_found() => {
                info!(remote_vm_id = remote, "Remote VM already deleted");
                Ok(StepResult::Done("already absent".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_deleted(&self, vm: &VmRecord) -> Result<StepResult> {
        let Some(remote) = vm.remote_vm_id else {
            return Ok(StepResult::Skipped("no remote VM".to_string()));
        };
        let attempts = self.config.state_wait_attempts.max(1);
        for attempt in 1..=attempts {
            match self.gateway.vm_config(remote).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(StepResult::Done("deleted".to_string())),
                Err(e) => return Err(e.into()),
            }
            if attempt < attempts {
                sleep(self.config.state_wait_interval()).await;
            }
        }
        Err(OrchestratorError::WaitTimeout {
            vm: remote,
            condition: "deleted".to_string(),
        })
    }

    async fn wait_agent(&self, vm: &VmRecord) -> Result<StepResult> {
        let remote = remote_id(vm)?;
        let attempts = self.config.agent_wait_attempts.max(1);
        for attempt in 1..=attempts {
            match self.gateway.agent_ping(remote).await {
                Ok(()) => {
                    return Ok(StepResult::Done(format!("agent reachable after {attempt} check(s)")))
                }
                Err(e) if e.is_not_found() => return Err(e.into()),
                Err(_) => {}
            }
            if attempt < attempts {
                sleep(self.config.agent_wait_interval()).await;
            }
        }
        // Templates are not required to ship the guest agent.
        warn!(remote_vm_id = remote, attempts, "Guest agent never answered, continuing");
        Ok(StepResult::Done(format!(
            "guest agent not reachable after {attempts} checks"
        )))
    }

    async fn finalize(&self, run: &Run, vm: &VmRecord) -> Result<StepResult> {
        match run.kind {
            RunKind::Build | RunKind::Rebuild => {
                self.vms.mark_installed(&vm.id).await?;
                Ok(StepResult::Done("installed".to_string()))
            }
            RunKind::Resize => {
                let status = run.prior_status.unwrap_or(vm.status);
                self.vms.finish_operation(&vm.id, status).await?;
                Ok(StepResult::Done(format!("status {status:?}").to_lowercase()))
            }
            RunKind::Delete => self.remove_record(&vm.id).await,
        }
    }

    async fn remove_record(&self, vm_id: &str) -> Result<StepResult> {
        match self.vms.delete(vm_id).await {
            Ok(()) | Err(OrchestratorError::NotFound(_)) => {
                self.progress.invalidate(vm_id);
                Ok(StepResult::Done("record removed".to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Status a VM settles in after a manual power action.
pub fn status_after_power(action: PowerAction) -> VmStatus {
    match action {
        PowerAction::Start | PowerAction::Reboot => VmStatus::Running,
        PowerAction::Stop | PowerAction::Shutdown => VmStatus::Stopped,
    }
}
