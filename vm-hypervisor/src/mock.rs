//! Scripted in-memory gateway for engine tests.
//!
//! The mock keeps a small model of the cluster (VM configs and power state)
//! and lets tests queue failures, lock observations and task statuses per
//! operation. Every call is recorded.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use crate::disk::{format_size, DiskDescriptor};
use crate::error::{GatewayError, RemoteApiError, Result};
use crate::gateway::Gateway;
use crate::types::{
    CloneOptions, GatewayResponse, PowerAction, RemoteVmConfig, RemoteVmId, TaskHandle,
    TaskStatus, VmRuntimeStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Call,
    NextId,
    Clone,
    Status,
    Config,
    UpdateConfig,
    Resize,
    TaskStatus,
    TaskLog,
    Power,
    Delete,
    AgentPing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub vm: Option<RemoteVmId>,
    pub detail: String,
}

#[derive(Default)]
struct MockState {
    next_id: RemoteVmId,
    configs: BTreeMap<RemoteVmId, RemoteVmConfig>,
    running: BTreeMap<RemoteVmId, bool>,
    locks: HashMap<RemoteVmId, VecDeque<Option<String>>>,
    failures: HashMap<MockOp, VecDeque<RemoteApiError>>,
    task_statuses: VecDeque<TaskStatus>,
    task_log: Vec<String>,
    agent_down: bool,
    task_seq: u32,
    calls: Vec<MockCall>,
}

#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

fn missing(vm: RemoteVmId) -> GatewayError {
    RemoteApiError::new(
        500,
        format!("Configuration file 'nodes/mock/qemu-server/{vm}.conf' does not exist"),
    )
    .into()
}

impl MockGateway {
    pub fn new() -> Self {
        let gateway = Self::default();
        gateway.lock().next_id = 100;
        gateway
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a VM (or template) with the given configuration.
    pub fn with_vm(self, vm: RemoteVmId, config: RemoteVmConfig) -> Self {
        {
            let mut state = self.lock();
            state.configs.insert(vm, config);
            state.running.insert(vm, false);
        }
        self
    }

    pub fn set_running(&self, vm: RemoteVmId, running: bool) {
        self.lock().running.insert(vm, running);
    }

    /// Queue lock observations returned by successive `vm_config` calls for `vm`.
    /// Once the queue drains, the stored config's own `lock` entry is reported.
    pub fn script_locks(&self, vm: RemoteVmId, locks: Vec<Option<&str>>) {
        self.lock()
            .locks
            .entry(vm)
            .or_default()
            .extend(locks.into_iter().map(|l| l.map(str::to_string)));
    }

    /// Make `vm` report a lock that never clears.
    pub fn hold_lock(&self, vm: RemoteVmId, lock: &str) {
        if let Some(config) = self.lock().configs.get_mut(&vm) {
            *config = std::mem::take(config).with("lock", lock);
        }
    }

    /// Queue failures for the next calls of `op`, in order.
    pub fn fail_next(&self, op: MockOp, errors: Vec<RemoteApiError>) {
        self.lock().failures.entry(op).or_default().extend(errors);
    }

    /// Queue statuses returned by successive `task_status` calls.
    /// Once drained, tasks report `stopped` with exit status `OK`.
    pub fn script_task_statuses(&self, statuses: Vec<TaskStatus>) {
        self.lock().task_statuses.extend(statuses);
    }

    pub fn set_task_log(&self, lines: Vec<&str>) {
        self.lock().task_log = lines.into_iter().map(str::to_string).collect();
    }

    pub fn set_agent_reachable(&self, reachable: bool) {
        self.lock().agent_down = !reachable;
    }

    pub fn config_of(&self, vm: RemoteVmId) -> Option<RemoteVmConfig> {
        self.lock().configs.get(&vm).cloned()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    fn enter(&self, op: MockOp, vm: Option<RemoteVmId>, detail: String) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall { op, vm, detail });
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn new_task(&self, kind: &str, vm: RemoteVmId) -> TaskHandle {
        let mut state = self.lock();
        state.task_seq += 1;
        TaskHandle::new(format!(
            "UPID:mock:{:08X}:00000000:00000000:{kind}:{vm}:root@pam:",
            state.task_seq
        ))
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn call(
        &self,
        method: Method,
        path: &str,
        _params: &[(String, String)],
    ) -> Result<GatewayResponse> {
        self.enter(MockOp::Call, None, format!("{method} {path}"))?;
        Ok(GatewayResponse::Data(serde_json::Value::Null))
    }

    async fn next_vm_id(&self) -> Result<RemoteVmId> {
        self.enter(MockOp::NextId, None, String::new())?;
        let mut state = self.lock();
        while state.configs.contains_key(&state.next_id) {
            state.next_id += 1;
        }
        // Handed-out ids are reserved so concurrent clones never collide.
        let id = state.next_id;
        state.next_id += 1;
        Ok(id)
    }

    async fn clone_vm(
        &self,
        template: RemoteVmId,
        new_id: RemoteVmId,
        options: &CloneOptions,
    ) -> Result<TaskHandle> {
        self.enter(MockOp::Clone, Some(new_id), format!("from {template}"))?;
        {
            let mut state = self.lock();
            let mut config = state.configs.get(&template).cloned().ok_or_else(|| missing(template))?;
            if let Some(name) = &options.name {
                config = config.with("name", name.clone());
            }
            state.configs.insert(new_id, config);
            state.running.insert(new_id, false);
        }
        Ok(self.new_task("qmclone", new_id))
    }

    async fn vm_status(&self, vm: RemoteVmId) -> Result<VmRuntimeStatus> {
        self.enter(MockOp::Status, Some(vm), String::new())?;
        let state = self.lock();
        let running = *state.running.get(&vm).ok_or_else(|| missing(vm))?;
        Ok(VmRuntimeStatus {
            state: if running { "running" } else { "stopped" }.to_string(),
            ..Default::default()
        })
    }

    async fn vm_config(&self, vm: RemoteVmId) -> Result<RemoteVmConfig> {
        self.enter(MockOp::Config, Some(vm), String::new())?;
        let mut state = self.lock();
        let config = state.configs.get(&vm).cloned().ok_or_else(|| missing(vm))?;
        match state.locks.get_mut(&vm).and_then(VecDeque::pop_front) {
            Some(lock) => Ok(config.with("lock", lock.unwrap_or_default())),
            None => Ok(config),
        }
    }

    async fn update_config(
        &self,
        vm: RemoteVmId,
        params: &[(String, String)],
    ) -> Result<Option<TaskHandle>> {
        let keys: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
        self.enter(MockOp::UpdateConfig, Some(vm), keys.join(","))?;
        let mut state = self.lock();
        let config = state.configs.get_mut(&vm).ok_or_else(|| missing(vm))?;
        for (key, value) in params {
            *config = std::mem::take(config).with(key.clone(), value.clone());
        }
        Ok(None)
    }

    async fn resize_disk(&self, vm: RemoteVmId, disk: &str, size: &str) -> Result<()> {
        self.enter(MockOp::Resize, Some(vm), format!("{disk}={size}"))?;
        let mut state = self.lock();
        let config = state.configs.get_mut(&vm).ok_or_else(|| missing(vm))?;
        let current = config.disk(disk).map(DiskDescriptor::parse).transpose()?;
        if let Some(current) = current {
            let bytes = crate::disk::parse_size_bytes(size)?;
            let descriptor = format!(
                "{}:{},size={}",
                current.storage,
                current.volume,
                format_size(bytes)
            );
            *config = std::mem::take(config).with(disk, descriptor);
        }
        Ok(())
    }

    async fn task_status(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        self.enter(MockOp::TaskStatus, None, handle.to_string())?;
        Ok(self
            .lock()
            .task_statuses
            .pop_front()
            .unwrap_or_else(|| TaskStatus::stopped("OK")))
    }

    async fn task_log(&self, handle: &TaskHandle) -> Result<Vec<String>> {
        self.enter(MockOp::TaskLog, None, handle.to_string())?;
        Ok(self.lock().task_log.clone())
    }

    async fn power(&self, vm: RemoteVmId, action: PowerAction) -> Result<TaskHandle> {
        self.enter(MockOp::Power, Some(vm), action.as_str().to_string())?;
        {
            let mut state = self.lock();
            let running = state.running.get_mut(&vm).ok_or_else(|| missing(vm))?;
            *running = matches!(action, PowerAction::Start | PowerAction::Reboot);
        }
        Ok(self.new_task(&format!("qm{}", action.as_str()), vm))
    }

    async fn delete_vm(&self, vm: RemoteVmId) -> Result<TaskHandle> {
        self.enter(MockOp::Delete, Some(vm), String::new())?;
        {
            let mut state = self.lock();
            state.configs.remove(&vm).ok_or_else(|| missing(vm))?;
            state.running.remove(&vm);
        }
        Ok(self.new_task("qmdestroy", vm))
    }

    async fn agent_ping(&self, vm: RemoteVmId) -> Result<()> {
        self.enter(MockOp::AgentPing, Some(vm), String::new())?;
        let state = self.lock();
        if !state.configs.contains_key(&vm) {
            return Err(missing(vm));
        }
        if state.agent_down {
            return Err(RemoteApiError::new(500, "QEMU guest agent did not respond to ping").into());
        }
        Ok(())
    }
}
