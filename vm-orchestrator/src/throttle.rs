//! Caps how many requests the engine has in flight against the cluster.
//!
//! Permits are held for one request only, never across the sleeps between
//! polls, so runs waiting on remote locks or tasks cost nothing here.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use vm_hypervisor::{
    CloneOptions, Gateway, GatewayError, GatewayResponse, Method, PowerAction, RemoteVmConfig,
    RemoteVmId, Result, TaskHandle, TaskStatus, VmRuntimeStatus,
};

pub struct ThrottledGateway {
    inner: Arc<dyn Gateway>,
    permits: Semaphore,
}

impl ThrottledGateway {
    pub fn new(inner: Arc<dyn Gateway>, max_concurrent: usize) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| GatewayError::Config("Request limiter closed".to_string()))
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Gateway for ThrottledGateway {
    async fn call(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<GatewayResponse> {
        let _permit = self.permit().await?;
        self.inner.call(method, path, params).await
    }

    async fn next_vm_id(&self) -> Result<RemoteVmId> {
        let _permit = self.permit().await?;
        self.inner.next_vm_id().await
    }

    async fn clone_vm(
        &self,
        template: RemoteVmId,
        new_id: RemoteVmId,
        options: &CloneOptions,
    ) -> Result<TaskHandle> {
        let _permit = self.permit().await?;
        self.inner.clone_vm(template, new_id, options).await
    }

    async fn vm_status(&self, vm: RemoteVmId) -> Result<VmRuntimeStatus> {
        let _permit = self.permit().await?;
        self.inner.vm_status(vm).await
    }

    async fn vm_config(&self, vm: RemoteVmId) -> Result<RemoteVmConfig> {
        let _permit = self.permit().await?;
        self.inner.vm_config(vm).await
    }

    async fn update_config(
        &self,
        vm: RemoteVmId,
        params: &[(String, String)],
    ) -> Result<Option<TaskHandle>> {
        let _permit = self.permit().await?;
        self.inner.update_config(vm, params).await
    }

    async fn resize_disk(&self, vm: RemoteVmId, disk: &str, size: &str) -> Result<()> {
        let _permit = self.permit().await?;
        self.inner.resize_disk(vm, disk, size).await
    }

    async fn task_status(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        let _permit = self.permit().await?;
        self.inner.task_status(handle).await
    }

    async fn task_log(&self, handle: &TaskHandle) -> Result<Vec<String>> {
        let _permit = self.permit().await?;
        self.inner.task_log(handle).await
    }

    async fn power(&self, vm: RemoteVmId, action: PowerAction) -> Result<TaskHandle> {
        let _permit = self.permit().await?;
        self.inner.power(vm, action).await
    }

    async fn delete_vm(&self, vm: RemoteVmId) -> Result<TaskHandle> {
        let _permit = self.permit().await?;
        self.inner.delete_vm(vm).await
    }

    async fn agent_ping(&self, vm: RemoteVmId) -> Result<()> {
        let _permit = self.permit().await?;
        self.inner.agent_ping(vm).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_hypervisor::mock::{MockGateway, MockOp};

    #[tokio::test]
    async fn test_permits_are_returned_after_each_request() {
        let mock = Arc::new(MockGateway::new().with_vm(101, RemoteVmConfig::default()));
        let gateway = ThrottledGateway::new(mock.clone(), 2);

        gateway.vm_config(101).await.unwrap();
        assert!(gateway.vm_config(999).await.is_err());

        assert_eq!(gateway.available(), 2);
        assert_eq!(mock.count(MockOp::Config), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_still_allows_one_request() {
        let mock = Arc::new(MockGateway::new().with_vm(101, RemoteVmConfig::default()));
        let gateway = ThrottledGateway::new(mock, 0);

        assert_eq!(gateway.available(), 1);
        gateway.vm_config(101).await.unwrap();
    }
}
