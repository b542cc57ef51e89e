//! HTTP implementation of [`Gateway`].

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::config::ClusterConfig;
use crate::error::{GatewayError, RemoteApiError, Result};
use crate::gateway::Gateway;
use crate::types::{
    CloneOptions, GatewayResponse, PowerAction, RemoteVmConfig, RemoteVmId, TaskHandle,
    TaskStatus, VmRuntimeStatus,
};

/// Authenticated client for a single cluster node.
#[derive(Clone)]
pub struct HypervisorClient {
    client: Client,
    config: ClusterConfig,
}

impl HypervisorClient {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        if config.token_id.is_empty() {
            return Err(GatewayError::Config(
                "Hypervisor API token id is not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(concat!("vm-hypervisor/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn node(&self) -> &str {
        &self.config.node
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn qemu_path(&self, vm: RemoteVmId, suffix: &str) -> String {
        format!("nodes/{}/qemu/{}{}", self.config.node, vm, suffix)
    }

    fn task_path(&self, handle: &TaskHandle, suffix: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(handle.as_str().as_bytes()).collect();
        format!("nodes/{}/tasks/{}{}", self.config.node, encoded, suffix)
    }

    async fn data(&self, method: Method, path: &str, params: &[(String, String)]) -> Result<Value> {
        let url = self.url(path);
        debug!(%method, url = %url, "Hypervisor API request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", self.config.authorization());

        request = if method == Method::GET || method == Method::DELETE {
            request.query(params)
        } else {
            request.form(params)
        };

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or_default().to_string();
            let body = response.text().await.unwrap_or_default();
            let message = error_text(&reason, &body);
            warn!(status = status.as_u16(), error = %message, "Hypervisor API error");
            return Err(RemoteApiError::new(status.as_u16(), message).into());
        }

        let envelope: Value = response.json().await?;
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }

    async fn task(&self, method: Method, path: &str, params: &[(String, String)]) -> Result<TaskHandle> {
        match GatewayResponse::from_data(self.data(method, path, params).await?) {
            GatewayResponse::Task(handle) => Ok(handle),
            GatewayResponse::Data(other) => Err(GatewayError::Decode(format!(
                "Expected task handle from {path}, got {other}"
            ))),
        }
    }
}

/// Combine the HTTP reason phrase with any `errors` detail from the body.
fn error_text(reason: &str, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            if let Some(message) = v.get("message").and_then(Value::as_str) {
                return Some(message.trim().to_string());
            }
            let errors = v.get("errors")?.as_object()?;
            let joined = errors
                .iter()
                .map(|(field, msg)| format!("{field}: {}", msg.as_str().unwrap_or_default().trim()))
                .collect::<Vec<_>>()
                .join("; ");
            Some(joined)
        })
        .filter(|s| !s.is_empty());

    match detail {
        Some(detail) if reason.is_empty() => detail,
        Some(detail) => format!("{reason} ({detail})"),
        None if body.trim().is_empty() || body.trim_start().starts_with('{') => reason.to_string(),
        None => format!("{reason}: {}", body.trim()),
    }
}

fn param(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

#[async_trait]
impl Gateway for HypervisorClient {
    async fn call(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<GatewayResponse> {
        Ok(GatewayResponse::from_data(self.data(method, path, params).await?))
    }

    async fn next_vm_id(&self) -> Result<RemoteVmId> {
        let data = self.data(Method::GET, "cluster/nextid", &[]).await?;
        match &data {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        }
        .ok_or_else(|| GatewayError::Decode(format!("Invalid next VM id: {data}")))
    }

    #[instrument(skip(self, options), fields(node = %self.config.node))]
    async fn clone_vm(
        &self,
        template: RemoteVmId,
        new_id: RemoteVmId,
        options: &CloneOptions,
    ) -> Result<TaskHandle> {
        let mut params = vec![param("newid", new_id), param("full", u8::from(options.full))];
        if let Some(name) = &options.name {
            params.push(param("name", name));
        }
        if let Some(storage) = &options.storage {
            params.push(param("storage", storage));
        }
        self.task(Method::POST, &self.qemu_path(template, "/clone"), &params)
            .await
    }

    async fn vm_status(&self, vm: RemoteVmId) -> Result<VmRuntimeStatus> {
        let data = self
            .data(Method::GET, &self.qemu_path(vm, "/status/current"), &[])
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn vm_config(&self, vm: RemoteVmId) -> Result<RemoteVmConfig> {
        let data = self
            .data(Method::GET, &self.qemu_path(vm, "/config"), &[])
            .await?;
        Ok(RemoteVmConfig::from_json(&data))
    }

    async fn update_config(
        &self,
        vm: RemoteVmId,
        params: &[(String, String)],
    ) -> Result<Option<TaskHandle>> {
        let data = self
            .data(Method::POST, &self.qemu_path(vm, "/config"), params)
            .await?;
        Ok(GatewayResponse::from_data(data).task())
    }

    async fn resize_disk(&self, vm: RemoteVmId, disk: &str, size: &str) -> Result<()> {
        let params = [param("disk", disk), param("size", size)];
        self.data(Method::PUT, &self.qemu_path(vm, "/resize"), &params)
            .await?;
        Ok(())
    }

    async fn task_status(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        let data = self
            .data(Method::GET, &self.task_path(handle, "/status"), &[])
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn task_log(&self, handle: &TaskHandle) -> Result<Vec<String>> {
        let params = [param("limit", 1000)];
        let data = self
            .data(Method::GET, &self.task_path(handle, "/log"), &params)
            .await?;

        let mut lines: Vec<(u64, String)> = data
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let n = entry.get("n")?.as_u64()?;
                        let text = entry.get("t")?.as_str()?.to_string();
                        Some((n, text))
                    })
                    .collect()
            })
            .unwrap_or_default();
        lines.sort_by_key(|(n, _)| *n);

        Ok(lines.into_iter().map(|(_, text)| text).collect())
    }

    async fn power(&self, vm: RemoteVmId, action: PowerAction) -> Result<TaskHandle> {
        let path = self.qemu_path(vm, &format!("/status/{}", action.as_str()));
        self.task(Method::POST, &path, &[]).await
    }

    async fn delete_vm(&self, vm: RemoteVmId) -> Result<TaskHandle> {
        let params = [param("purge", 1)];
        self.task(Method::DELETE, &self.qemu_path(vm, ""), &params)
            .await
    }

    async fn agent_ping(&self, vm: RemoteVmId) -> Result<()> {
        self.data(Method::POST, &self.qemu_path(vm, "/agent/ping"), &[])
            .await?;
        Ok(())
    }
}
