use serde::Deserialize;
use std::time::Duration;

/// Connection settings for one hypervisor cluster node.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// API root, e.g. `https://pve1.example.net:8006/api2/json`
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_node")]
    pub node: String,

    #[serde(default = "default_token_id")]
    pub token_id: String,

    #[serde(default = "default_token_secret")]
    pub token_secret: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Clusters commonly run with self-signed certificates.
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
}

fn default_api_url() -> String {
    std::env::var("VM_HV_URL").unwrap_or_else(|_| "https://127.0.0.1:8006/api2/json".to_string())
}

fn default_node() -> String {
    std::env::var("VM_HV_NODE").unwrap_or_else(|_| "pve".to_string())
}

fn default_token_id() -> String {
    std::env::var("VM_HV_TOKEN_ID").unwrap_or_default()
}

fn default_token_secret() -> String {
    std::env::var("VM_HV_TOKEN_SECRET").unwrap_or_default()
}

fn default_request_timeout_secs() -> u64 {
    std::env::var("VM_HV_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30)
}

fn default_accept_invalid_certs() -> bool {
    std::env::var("VM_HV_INSECURE")
        .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            node: default_node(),
            token_id: default_token_id(),
            token_secret: default_token_secret(),
            request_timeout_secs: default_request_timeout_secs(),
            accept_invalid_certs: default_accept_invalid_certs(),
        }
    }
}

impl ClusterConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Value of the `Authorization` header for API token auth.
    pub fn authorization(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }
}
