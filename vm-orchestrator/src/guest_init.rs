//! First-boot guest parameters: user, password, SSH keys and network.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use vm_hypervisor::{Gateway, RemoteVmId};

use crate::backoff::BackoffSchedule;
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::task_monitor::TaskMonitor;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCredentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Primary address assigned to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub ip: String,
    pub cidr: u8,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl NetworkAddress {
    pub fn validate(&self) -> Result<()> {
        let ip: std::net::IpAddr = self
            .ip
            .parse()
            .map_err(|_| OrchestratorError::InvalidInput(format!("Invalid IP address: {}", self.ip)))?;
        let max_prefix = if ip.is_ipv4() { 32 } else { 128 };
        if self.cidr > max_prefix {
            return Err(OrchestratorError::InvalidInput(format!(
                "Invalid prefix length /{} for {}",
                self.cidr, self.ip
            )));
        }
        if let Some(gateway) = &self.gateway {
            gateway.parse::<std::net::IpAddr>().map_err(|_| {
                OrchestratorError::InvalidInput(format!("Invalid gateway address: {gateway}"))
            })?;
        }
        Ok(())
    }

    /// `ipconfig0` value, e.g. `ip=10.0.0.5/24,gw=10.0.0.1`.
    pub fn to_ipconfig(&self) -> String {
        let is_v6 = self.ip.contains(':');
        let (ip_key, gw_key) = if is_v6 { ("ip6", "gw6") } else { ("ip", "gw") };
        match &self.gateway {
            Some(gw) => format!("{ip_key}={}/{},{gw_key}={gw}", self.ip, self.cidr),
            None => format!("{ip_key}={}/{}", self.ip, self.cidr),
        }
    }
}

/// Everything that goes into one guest-init update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestInitRequest {
    pub username: String,
    pub password: Option<String>,
    pub ssh_keys: Vec<String>,
    pub address: Option<NetworkAddress>,
}

/// Default login for a template, guessed from its OS hint or name.
pub fn default_username(os_hint: Option<&str>, template_name: Option<&str>) -> &'static str {
    let haystack = format!(
        "{} {}",
        os_hint.unwrap_or_default(),
        template_name.unwrap_or_default()
    )
    .to_ascii_lowercase();

    const USERS: &[(&str, &str)] = &[
        ("ubuntu", "ubuntu"),
        ("debian", "debian"),
        ("centos", "centos"),
        ("rocky", "rocky"),
        ("alma", "almalinux"),
        ("fedora", "fedora"),
        ("arch", "arch"),
        ("opensuse", "opensuse"),
        ("windows", "Administrator"),
    ];

    USERS
        .iter()
        .find(|(needle, _)| haystack.contains(needle))
        .map(|(_, user)| *user)
        .unwrap_or("root")
}

/// Explicit keys first, then stored account keys, without duplicates.
pub fn merge_ssh_keys(explicit: &[String], account: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for key in explicit.iter().chain(account) {
        let key = key.trim();
        if !key.is_empty() && !merged.iter().any(|k| k == key) {
            merged.push(key.to_string());
        }
    }
    merged
}

/// Percent-encode for the `sshkeys` field, which the remote expects encoded
/// once more on top of the form encoding.
fn encode_ssh_keys(keys: &[String]) -> String {
    let joined = keys.join("\n");
    url::form_urlencoded::byte_serialize(joined.as_bytes())
        .collect::<String>()
        // Spaces must be %20; a literal '+' is already %2B at this point.
        .replace('+', "%20")
}

impl GuestInitRequest {
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("ciuser".to_string(), self.username.clone())];
        if let Some(password) = &self.password {
            params.push(("cipassword".to_string(), password.clone()));
        }
        if !self.ssh_keys.is_empty() {
            params.push(("sshkeys".to_string(), encode_ssh_keys(&self.ssh_keys)));
        }
        if let Some(address) = &self.address {
            params.push(("ipconfig0".to_string(), address.to_ipconfig()));
        }
        params
    }
}

#[derive(Clone)]
pub struct GuestInitConfigurator {
    gateway: Arc<dyn Gateway>,
    monitor: TaskMonitor,
    schedule: BackoffSchedule,
    config_timeout: Duration,
}

impl GuestInitConfigurator {
    pub fn new(gateway: Arc<dyn Gateway>, config: &EngineConfig) -> Self {
        Self {
            monitor: TaskMonitor::new(gateway.clone(), config.task_poll_interval()),
            gateway,
            schedule: config.guest_init_schedule(),
            config_timeout: Duration::from_secs(config.config_timeout_secs),
        }
    }

    /// Submit the guest-init parameters as one config update. Lock and timeout
    /// errors are retried on the guest-init schedule; anything else is fatal.
    /// Returns the number of attempts used.
    #[instrument(skip(self, request), fields(user = %request.username, keys = request.ssh_keys.len()))]
    pub async fn apply(&self, vm: RemoteVmId, request: &GuestInitRequest) -> Result<u32> {
        let params = request.to_params();
        let max_attempts = self.schedule.max_attempts();

        for attempt in 1..=max_attempts {
            match self.submit(vm, &params).await {
                Ok(()) => {
                    info!(attempt, "Guest-init parameters applied");
                    self.regenerate(vm);
                    return Ok(attempt);
                }
                Err(e) if e.is_contention() && attempt < max_attempts => {
                    let delay = self.schedule.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Guest-init update hit contention, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(OrchestratorError::InvalidState(
            "Guest-init retry loop ended without a result".to_string(),
        ))
    }

    async fn submit(&self, vm: RemoteVmId, params: &[(String, String)]) -> Result<()> {
        if let Some(task) = self.gateway.update_config(vm, params).await? {
            self.monitor.wait_for_task(&task, self.config_timeout).await?;
        }
        Ok(())
    }

    /// The remote rebuilds the guest-init image on its own after a config
    /// change; this only marks the point in the logs.
    fn regenerate(&self, vm: RemoteVmId) {
        debug!(vm, "Guest-init image will be regenerated by the remote");
    }
}
