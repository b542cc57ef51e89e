//! Idempotent application of CPU, memory and disk targets.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use vm_hypervisor::{
    format_size, DiskDescriptor, Gateway, RemoteErrorKind, RemoteVmConfig, RemoteVmId, MIB,
};

use crate::backoff::BackoffSchedule;
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::lock_wait::LockWaiter;
use crate::task_monitor::TaskMonitor;
use crate::vm::ResourceSpec;

/// Values read back from the remote config after a change.
/// `None` means the remote did not confirm that field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfirmedResources {
    pub cpu_cores: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

impl ConfirmedResources {
    fn merge(self, other: ConfirmedResources) -> Self {
        Self {
            cpu_cores: other.cpu_cores.or(self.cpu_cores),
            memory_bytes: other.memory_bytes.or(self.memory_bytes),
            disk_bytes: other.disk_bytes.or(self.disk_bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DiskResize {
    /// Disk already within tolerance of the target; no call was made.
    Skipped { current_bytes: u64 },
    Resized { attempts: u32 },
    /// The remote reported the disk is already at (or above) the target.
    AlreadySatisfied,
    /// Gave up on a non-contention error; the disk keeps its old size.
    Abandoned { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskResizeReport {
    #[serde(flatten)]
    pub outcome: DiskResize,
    pub confirmed_bytes: Option<u64>,
}

#[derive(Clone)]
pub struct ResourceConfigurator {
    gateway: Arc<dyn Gateway>,
    monitor: TaskMonitor,
    locks: LockWaiter,
    schedule: BackoffSchedule,
    config_timeout: Duration,
}

fn memory_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

fn read_cpu_memory(config: &RemoteVmConfig) -> ConfirmedResources {
    ConfirmedResources {
        cpu_cores: config.get("cores").and_then(|v| v.parse().ok()),
        memory_bytes: config
            .get("memory")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|mib| mib * MIB),
        disk_bytes: None,
    }
}

impl ResourceConfigurator {
    pub fn new(gateway: Arc<dyn Gateway>, config: &EngineConfig) -> Self {
        Self {
            monitor: TaskMonitor::new(gateway.clone(), config.task_poll_interval()),
            locks: LockWaiter::new(
                gateway.clone(),
                config.lock_wait_attempts,
                config.lock_wait_interval(),
            ),
            gateway,
            schedule: config.resize_schedule(),
            config_timeout: Duration::from_secs(config.config_timeout_secs),
        }
    }

    /// Write CPU and memory. The remote simply overwrites, so this is safe to repeat.
    #[instrument(skip(self))]
    pub async fn apply_cpu_memory(
        &self,
        vm: RemoteVmId,
        cpu_cores: u32,
        memory_bytes: u64,
    ) -> Result<ConfirmedResources> {
        let params = vec![
            ("cores".to_string(), cpu_cores.to_string()),
            ("memory".to_string(), memory_mib(memory_bytes).to_string()),
        ];

        if let Some(task) = self.gateway.update_config(vm, &params).await? {
            self.monitor.wait_for_task(&task, self.config_timeout).await?;
        }

        let config = self.gateway.vm_config(vm).await?;
        let confirmed = read_cpu_memory(&config);
        info!(
            cpu_cores = ?confirmed.cpu_cores,
            memory_bytes = ?confirmed.memory_bytes,
            "CPU and memory applied"
        );
        Ok(confirmed)
    }

    /// Grow `disk_key` to `target_bytes`.
    ///
    /// Skips the call when the disk is already within tolerance. Contention is
    /// retried on the resize schedule and fatal once exhausted; other errors
    /// abandon the resize with a warning. After a resize (or skip) the VM must
    /// be unlocked again before this returns.
    #[instrument(skip(self))]
    pub async fn resize_disk(
        &self,
        vm: RemoteVmId,
        disk_key: &str,
        target_bytes: u64,
    ) -> Result<DiskResizeReport> {
        let config = self.gateway.vm_config(vm).await?;
        let raw = config.disk(disk_key).ok_or_else(|| {
            OrchestratorError::InvalidState(format!("VM {vm} has no disk {disk_key}"))
        })?;
        let current = DiskDescriptor::parse(raw)?;

        let outcome = if current.satisfies(target_bytes) {
            let current_bytes = current.size_bytes.unwrap_or_default();
            info!(current_bytes, target_bytes, "Disk already at target size, skipping resize");
            DiskResize::Skipped { current_bytes }
        } else {
            self.resize_with_retry(vm, disk_key, target_bytes).await?
        };

        if let DiskResize::Abandoned { .. } = outcome {
            return Ok(DiskResizeReport {
                outcome,
                confirmed_bytes: None,
            });
        }

        let config = self.locks.ensure_unlocked(vm).await?;
        let confirmed_bytes = config
            .disk(disk_key)
            .and_then(|raw| DiskDescriptor::parse(raw).ok())
            .and_then(|disk| disk.size_bytes);

        Ok(DiskResizeReport {
            outcome,
            confirmed_bytes,
        })
    }

    async fn resize_with_retry(
        &self,
        vm: RemoteVmId,
        disk_key: &str,
        target_bytes: u64,
    ) -> Result<DiskResize> {
        let size = format_size(target_bytes);
        let max_attempts = self.schedule.max_attempts();

        for attempt in 1..=max_attempts {
            let err = match self.gateway.resize_disk(vm, disk_key, &size).await {
                Ok(()) => {
                    info!(attempt, size = %size, "Disk resized");
                    return Ok(DiskResize::Resized { attempts: attempt });
                }
                Err(e) => e,
            };

            match err.kind() {
                RemoteErrorKind::AlreadySatisfied => {
                    info!(error = %err, "Disk already satisfies target");
                    return Ok(DiskResize::AlreadySatisfied);
                }
                RemoteErrorKind::Validation => {
                    warn!(error = %err, "Resize rejected, continuing with current disk size");
                    return Ok(DiskResize::Abandoned {
                        error: err.to_string(),
                    });
                }
                _ if attempt == max_attempts => {
                    if err.is_contention() {
                        return Err(err.into());
                    }
                    warn!(attempt, error = %err, "Resize failed, continuing with current disk size");
                    return Ok(DiskResize::Abandoned {
                        error: err.to_string(),
                    });
                }
                _ => {
                    let delay = self.schedule.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Resize failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }

        // max_attempts is at least one, so the loop always returns.
        Err(OrchestratorError::InvalidState(
            "Resize retry loop ended without a result".to_string(),
        ))
    }

    /// CPU, memory and disk in one go, as used when reconfiguring a rebuilt VM.
    pub async fn apply(
        &self,
        vm: RemoteVmId,
        target: &ResourceSpec,
        disk_key: &str,
    ) -> Result<(ConfirmedResources, DiskResizeReport)> {
        let confirmed = self
            .apply_cpu_memory(vm, target.cpu_cores, target.memory_bytes)
            .await?;
        self.locks.ensure_unlocked(vm).await?;
        let disk = self.resize_disk(vm, disk_key, target.disk_bytes).await?;

        let confirmed = confirmed.merge(ConfirmedResources {
            disk_bytes: disk.confirmed_bytes,
            ..Default::default()
        });
        Ok((confirmed, disk))
    }
}
