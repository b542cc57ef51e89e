use serde::Deserialize;
use std::time::Duration;

use crate::backoff::BackoffSchedule;

/// Timing and capacity knobs for the orchestration engine.
///
/// `Default` gives the built-in values; [`EngineConfig::from_env`] overlays
/// any `VM_ENGINE_*` variables that are set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub task_poll_interval_secs: u64,

    pub power_timeout_secs: u64,
    pub config_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    pub delete_timeout_secs: u64,

    /// Remote config lock polling.
    pub lock_wait_attempts: u32,
    pub lock_wait_interval_secs: u64,

    /// Waiting for a VM to stop or disappear.
    pub state_wait_attempts: u32,
    pub state_wait_interval_secs: u64,

    /// Waiting for the guest agent after power on.
    pub agent_wait_attempts: u32,
    pub agent_wait_interval_secs: u64,

    /// Disk resize retries.
    pub resize_backoff_secs: Vec<u64>,
    pub resize_attempts: u32,

    /// Guest-init update retries on lock contention.
    pub guest_init_backoff_secs: Vec<u64>,
    pub guest_init_attempts: u32,

    pub lease_ttl_secs: u64,
    pub progress_ttl_secs: u64,
    /// Requests allowed in flight against the cluster at once.
    pub max_remote_calls: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_poll_interval_secs: 2,
            power_timeout_secs: 60,
            config_timeout_secs: 120,
            clone_timeout_secs: 900,
            delete_timeout_secs: 300,
            lock_wait_attempts: 60,
            lock_wait_interval_secs: 5,
            state_wait_attempts: 30,
            state_wait_interval_secs: 2,
            agent_wait_attempts: 30,
            agent_wait_interval_secs: 5,
            resize_backoff_secs: vec![10, 20, 40, 60, 60],
            resize_attempts: 5,
            guest_init_backoff_secs: vec![5, 10, 15, 20, 30, 40, 50, 60],
            guest_init_attempts: 10,
            lease_ttl_secs: 1800,
            progress_ttl_secs: 300,
            max_remote_calls: 4,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn env_list_or(name: &str, fallback: Vec<u64>) -> Vec<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| {
            s.split(',')
                .map(|part| part.trim().parse().ok())
                .collect::<Option<Vec<u64>>>()
        })
        .filter(|list| !list.is_empty())
        .unwrap_or(fallback)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            task_poll_interval_secs: env_or("VM_ENGINE_TASK_POLL_SECS", d.task_poll_interval_secs),
            power_timeout_secs: env_or("VM_ENGINE_POWER_TIMEOUT_SECS", d.power_timeout_secs),
            config_timeout_secs: env_or("VM_ENGINE_CONFIG_TIMEOUT_SECS", d.config_timeout_secs),
            clone_timeout_secs: env_or("VM_ENGINE_CLONE_TIMEOUT_SECS", d.clone_timeout_secs),
            delete_timeout_secs: env_or("VM_ENGINE_DELETE_TIMEOUT_SECS", d.delete_timeout_secs),
            lock_wait_attempts: env_or("VM_ENGINE_LOCK_WAIT_ATTEMPTS", d.lock_wait_attempts),
            lock_wait_interval_secs: env_or("VM_ENGINE_LOCK_WAIT_SECS", d.lock_wait_interval_secs),
            state_wait_attempts: env_or("VM_ENGINE_STATE_WAIT_ATTEMPTS", d.state_wait_attempts),
            state_wait_interval_secs: env_or("VM_ENGINE_STATE_WAIT_SECS", d.state_wait_interval_secs),
            agent_wait_attempts: env_or("VM_ENGINE_AGENT_WAIT_ATTEMPTS", d.agent_wait_attempts),
            agent_wait_interval_secs: env_or("VM_ENGINE_AGENT_WAIT_SECS", d.agent_wait_interval_secs),
            resize_backoff_secs: env_list_or("VM_ENGINE_RESIZE_BACKOFF", d.resize_backoff_secs),
            resize_attempts: env_or("VM_ENGINE_RESIZE_ATTEMPTS", d.resize_attempts),
            guest_init_backoff_secs: env_list_or(
                "VM_ENGINE_GUEST_INIT_BACKOFF",
                d.guest_init_backoff_secs,
            ),
            guest_init_attempts: env_or("VM_ENGINE_GUEST_INIT_ATTEMPTS", d.guest_init_attempts),
            lease_ttl_secs: env_or("VM_ENGINE_LEASE_TTL_SECS", d.lease_ttl_secs),
            progress_ttl_secs: env_or("VM_ENGINE_PROGRESS_TTL_SECS", d.progress_ttl_secs),
            max_remote_calls: env_or("VM_ENGINE_MAX_REMOTE_CALLS", d.max_remote_calls).max(1),
        }
    }

    pub fn resize_schedule(&self) -> BackoffSchedule {
        BackoffSchedule::from_secs(&self.resize_backoff_secs, self.resize_attempts)
    }

    pub fn guest_init_schedule(&self) -> BackoffSchedule {
        BackoffSchedule::from_secs(&self.guest_init_backoff_secs, self.guest_init_attempts)
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_secs(self.task_poll_interval_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    pub fn lock_wait_interval(&self) -> Duration {
        Duration::from_secs(self.lock_wait_interval_secs)
    }

    pub fn state_wait_interval(&self) -> Duration {
        Duration::from_secs(self.state_wait_interval_secs)
    }

    pub fn agent_wait_interval(&self) -> Duration {
        Duration::from_secs(self.agent_wait_interval_secs)
    }
}
