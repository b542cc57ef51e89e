use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Remote numeric VM identifier.
pub type RemoteVmId = u32;

/// Opaque handle for an asynchronous remote task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub const PREFIX: &'static str = "UPID:";

    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Recognise a task handle in a raw `data` string.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.starts_with(Self::PREFIX).then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a raw gateway call: synchronous data or a task to poll.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResponse {
    Data(serde_json::Value),
    Task(TaskHandle),
}

impl GatewayResponse {
    /// Interpret the `data` member of an API envelope.
    pub fn from_data(data: serde_json::Value) -> Self {
        match data.as_str().and_then(TaskHandle::parse) {
            Some(handle) => GatewayResponse::Task(handle),
            None => GatewayResponse::Data(data),
        }
    }

    pub fn task(self) -> Option<TaskHandle> {
        match self {
            GatewayResponse::Task(handle) => Some(handle),
            GatewayResponse::Data(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Stopped,
}

/// Exit status reported by the remote system for a successful task.
pub const TASK_EXIT_OK: &str = "OK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    #[serde(default, rename = "exitstatus")]
    pub exit_status: Option<String>,
}

impl TaskStatus {
    pub fn running() -> Self {
        Self {
            status: TaskState::Running,
            exit_status: None,
        }
    }

    pub fn stopped(exit_status: impl Into<String>) -> Self {
        Self {
            status: TaskState::Stopped,
            exit_status: Some(exit_status.into()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskState::Running
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskState::Stopped && self.exit_status.as_deref() == Some(TASK_EXIT_OK)
    }
}

/// Live runtime status of a VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmRuntimeStatus {
    #[serde(rename = "status")]
    pub state: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default, rename = "mem")]
    pub mem_used: u64,
    #[serde(default, rename = "maxmem")]
    pub mem_total: u64,
    #[serde(default, rename = "disk")]
    pub disk_used: u64,
    #[serde(default, rename = "maxdisk")]
    pub disk_total: u64,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default, rename = "netin")]
    pub net_in: u64,
    #[serde(default, rename = "netout")]
    pub net_out: u64,
}

impl VmRuntimeStatus {
    pub fn is_stopped(&self) -> bool {
        self.state == "stopped"
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Key/value VM configuration as returned by the remote system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteVmConfig {
    entries: BTreeMap<String, String>,
}

impl RemoteVmConfig {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Build from the API's JSON object, stringifying scalar values.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let entries = value
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(key, value)| {
                        let value = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The lock the remote system holds on this VM, if any (`clone`, `backup`, ...).
    pub fn lock(&self) -> Option<&str> {
        self.get("lock").filter(|value| !value.is_empty())
    }

    pub fn disk(&self, key: &str) -> Option<&str> {
        self.get(key)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneOptions {
    pub name: Option<String>,
    pub full: bool,
    pub storage: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Shutdown,
    Reboot,
}

impl PowerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Reboot => "reboot",
        }
    }
}

impl std::str::FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(PowerAction::Start),
            "stop" => Ok(PowerAction::Stop),
            "shutdown" => Ok(PowerAction::Shutdown),
            "reboot" => Ok(PowerAction::Reboot),
            other => Err(format!("Unknown power action: {other}")),
        }
    }
}
