//! Integration tests for the janitor task
//!
//! The janitor fails runs whose worker disappeared without keeping its
//! lease alive, and drops leases that have expired.

mod common;

use common::{create_vm_body, json_body, TestClient};
use std::time::Duration;
use vm_api::start_janitor_task;
use vm_orchestrator::lease::{run_owner, LeaseStore};
use vm_orchestrator::run::RunStore;
use vm_orchestrator::{RunStatus, VmStatus};

async fn create_vm(client: &TestClient, name: &str) -> (String, String) {
    let response = client
        .post("/api/v1/vms", "alice", &create_vm_body(name))
        .await;
    let json = json_body(response).await;
    (
        json["vm"]["id"].as_str().unwrap().to_string(),
        json["run"]["id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn test_janitor_fails_run_without_lease() {
    let client = TestClient::new().await;
    let (vm_id, run_id) = create_vm(&client, "web-1").await;

    // Claimed by a worker that died before taking its lease.
    let runs = RunStore::new(client.orchestrator.pool().clone());
    assert!(runs.claim(&run_id).await.unwrap());

    let report = client.orchestrator.janitor_sweep().await.unwrap();
    assert_eq!(report.orphaned_runs, 1);

    let run = runs.get(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let vm = client.orchestrator.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Failed);
}

#[tokio::test]
async fn test_janitor_ignores_run_with_live_lease() {
    let client = TestClient::new().await;
    let (_vm_id, run_id) = create_vm(&client, "web-1").await;
    let pending = create_vm(&client, "web-2").await;

    let pool = client.orchestrator.pool().clone();
    let runs = RunStore::new(pool.clone());
    assert!(runs.claim(&run_id).await.unwrap());
    let run = runs.get(&run_id).await.unwrap();
    LeaseStore::new(pool)
        .acquire(&run.vm_id, &run_owner(&run_id), Duration::from_secs(300))
        .await
        .unwrap();

    let report = client.orchestrator.janitor_sweep().await.unwrap();
    assert_eq!(report.orphaned_runs, 0);

    assert_eq!(runs.get(&run_id).await.unwrap().status, RunStatus::Running);
    // Pending runs have no lease yet and are left alone.
    assert_eq!(runs.get(&pending.1).await.unwrap().status, RunStatus::Pending);
}

#[tokio::test]
async fn test_janitor_purges_expired_leases() {
    let client = TestClient::new().await;
    let (vm_id, _run_id) = create_vm(&client, "web-1").await;

    let leases = LeaseStore::new(client.orchestrator.pool().clone());
    leases
        .acquire(&vm_id, "manual:alice", Duration::ZERO)
        .await
        .unwrap();

    let report = client.orchestrator.janitor_sweep().await.unwrap();
    assert_eq!(report.expired_leases, 1);
    assert!(leases.current(&vm_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_janitor_task_sweeps_in_background() {
    let client = TestClient::new().await;
    let (_vm_id, run_id) = create_vm(&client, "web-1").await;

    let runs = RunStore::new(client.orchestrator.pool().clone());
    assert!(runs.claim(&run_id).await.unwrap());

    let handle = tokio::spawn(start_janitor_task(client.orchestrator.clone(), 1));

    // The first tick fires immediately.
    let mut status = RunStatus::Running;
    for _ in 0..100 {
        status = runs.get(&run_id).await.unwrap().status;
        if status == RunStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.abort();

    assert_eq!(status, RunStatus::Failed);
}
