//! Shared helpers for the vm-api integration tests.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use vm_api::{create_app, AppState};
use vm_hypervisor::mock::MockGateway;
use vm_hypervisor::GIB;
use vm_orchestrator::test_utils::{create_test_db, mock_cluster, TEMPLATE_ID};
use vm_orchestrator::{EngineConfig, VmOrchestrator};

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        task_poll_interval_secs: 0,
        lock_wait_attempts: 3,
        lock_wait_interval_secs: 0,
        state_wait_attempts: 3,
        state_wait_interval_secs: 0,
        agent_wait_attempts: 1,
        agent_wait_interval_secs: 0,
        resize_backoff_secs: vec![0],
        guest_init_backoff_secs: vec![0],
        ..EngineConfig::default()
    }
}

/// A test app backed by an in-memory database and the mock cluster.
pub struct TestClient {
    pub app: Router,
    pub orchestrator: VmOrchestrator,
    pub gateway: Arc<MockGateway>,
}

impl TestClient {
    pub async fn new() -> Self {
        let pool = create_test_db().await;
        let gateway = Arc::new(mock_cluster());
        let state = AppState::new(pool, gateway.clone(), fast_config());
        let orchestrator = state.orchestrator.clone();
        let app = create_app(state).await.expect("Failed to create test app");
        Self {
            app,
            orchestrator,
            gateway,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str, user: &str) -> Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("x-user", user)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post(&self, uri: &str, user: &str, body: &Value) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-user", user)
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn delete(&self, uri: &str, user: &str) -> Response<Body> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("x-user", user)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Create a VM through the API and drive its build to completion.
    pub async fn built_vm(&self, name: &str, owner: &str) -> String {
        let response = self.post("/api/v1/vms", owner, &create_vm_body(name)).await;
        assert_eq!(response.status(), axum::http::StatusCode::ACCEPTED);
        let created = json_body(response).await;
        let run_id = created["run"]["id"].as_str().unwrap().to_string();
        self.orchestrator
            .sequencer()
            .drive(&run_id)
            .await
            .expect("Build should not error");
        created["vm"]["id"].as_str().unwrap().to_string()
    }
}

pub fn create_vm_body(name: &str) -> Value {
    serde_json::json!({
        "name": name,
        "template": {
            "remote_id": TEMPLATE_ID,
            "name": "ubuntu-2404-cloud",
            "min_disk_bytes": 10 * GIB
        },
        "resources": {
            "cpu_cores": 2,
            "memory_bytes": 2 * GIB,
            "disk_bytes": 10 * GIB
        }
    })
}

pub async fn json_body(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}
