//! Waiting out the remote system's own configuration locks.
//!
//! This is a polling read, not a mutex: the remote side may take the lock
//! again between a successful check and the next mutation.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};
use vm_hypervisor::{Gateway, RemoteVmConfig, RemoteVmId};

use crate::error::{OrchestratorError, Result};

#[derive(Clone)]
pub struct LockWaiter {
    gateway: Arc<dyn Gateway>,
    max_attempts: u32,
    interval: Duration,
}

impl LockWaiter {
    pub fn new(gateway: Arc<dyn Gateway>, max_attempts: u32, interval: Duration) -> Self {
        Self {
            gateway,
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Poll the VM config until it carries no `lock` entry. Returns the
    /// unlocked config, or `None` once the attempts are exhausted.
    #[instrument(skip(self))]
    pub async fn unlocked_config(&self, vm: RemoteVmId) -> Result<Option<RemoteVmConfig>> {
        for attempt in 1..=self.max_attempts {
            let config = self.gateway.vm_config(vm).await?;
            match config.lock() {
                None => {
                    if attempt > 1 {
                        debug!(attempt, "Lock cleared");
                    }
                    return Ok(Some(config));
                }
                Some(lock) => {
                    debug!(attempt, lock, "VM config is locked");
                }
            }
            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }

        warn!(attempts = self.max_attempts, "VM still locked");
        Ok(None)
    }

    /// True the moment the lock is absent, false if it never cleared.
    pub async fn wait_until_unlocked(&self, vm: RemoteVmId) -> Result<bool> {
        Ok(self.unlocked_config(vm).await?.is_some())
    }

    /// Like [`wait_until_unlocked`](Self::wait_until_unlocked) but a lock that
    /// never clears is a `LockTimeout` error.
    pub async fn ensure_unlocked(&self, vm: RemoteVmId) -> Result<RemoteVmConfig> {
        self.unlocked_config(vm)
            .await?
            .ok_or(OrchestratorError::LockTimeout {
                vm,
                attempts: self.max_attempts,
            })
    }
}
