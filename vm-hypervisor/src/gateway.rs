use async_trait::async_trait;
use reqwest::Method;

use crate::error::Result;
use crate::types::{
    CloneOptions, GatewayResponse, PowerAction, RemoteVmConfig, RemoteVmId, TaskHandle,
    TaskStatus, VmRuntimeStatus,
};

/// The contract between the orchestration engine and the hypervisor API.
///
/// Every method issues exactly one request. Implementations never retry;
/// retry policy belongs to the caller.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Issue a raw request. `params` are sent as the query string for `GET`
    /// and `DELETE`, and as a form body otherwise.
    async fn call(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<GatewayResponse>;

    /// Ask the cluster for the next free VM id.
    async fn next_vm_id(&self) -> Result<RemoteVmId>;

    /// Full copy of `template` into a new VM `new_id`.
    async fn clone_vm(
        &self,
        template: RemoteVmId,
        new_id: RemoteVmId,
        options: &CloneOptions,
    ) -> Result<TaskHandle>;

    async fn vm_status(&self, vm: RemoteVmId) -> Result<VmRuntimeStatus>;

    async fn vm_config(&self, vm: RemoteVmId) -> Result<RemoteVmConfig>;

    /// Returns `None` when the remote acknowledged the update synchronously.
    async fn update_config(
        &self,
        vm: RemoteVmId,
        params: &[(String, String)],
    ) -> Result<Option<TaskHandle>>;

    /// Fire-and-forget disk resize; `size` uses the descriptor size syntax.
    async fn resize_disk(&self, vm: RemoteVmId, disk: &str, size: &str) -> Result<()>;

    async fn task_status(&self, handle: &TaskHandle) -> Result<TaskStatus>;

    async fn task_log(&self, handle: &TaskHandle) -> Result<Vec<String>>;

    async fn power(&self, vm: RemoteVmId, action: PowerAction) -> Result<TaskHandle>;

    async fn delete_vm(&self, vm: RemoteVmId) -> Result<TaskHandle>;

    /// Succeeds when the guest agent inside the VM answers.
    async fn agent_ping(&self, vm: RemoteVmId) -> Result<()>;
}
