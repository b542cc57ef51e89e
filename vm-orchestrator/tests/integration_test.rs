//! Integration tests for vm-orchestrator
//!
//! Drives complete workflows against the scripted mock cluster and an
//! in-memory database. Intervals are zeroed so runs finish in real time.

use std::sync::Arc;
use std::time::Duration;
use vm_hypervisor::mock::{MockGateway, MockOp};
use vm_hypervisor::{CloneOptions, Gateway, PowerAction, RemoteApiError, GIB};
use vm_orchestrator::lease::LeaseStore;
use vm_orchestrator::run::RunStore;
use vm_orchestrator::test_utils::{create_test_db, mock_cluster, TEMPLATE_ID};
use vm_orchestrator::{
    CreateVmRequest, Dispatcher, EngineConfig, OrchestratorError, RebuildRequest, ResourceSpec,
    RunStatus, StepKind, StepOutcome, StepStatus, TemplateRef, VmOrchestrator, VmStatus,
};

fn fast_config() -> EngineConfig {
    EngineConfig {
        task_poll_interval_secs: 0,
        lock_wait_attempts: 3,
        lock_wait_interval_secs: 0,
        state_wait_attempts: 3,
        state_wait_interval_secs: 0,
        agent_wait_attempts: 2,
        agent_wait_interval_secs: 0,
        resize_backoff_secs: vec![0],
        guest_init_backoff_secs: vec![0],
        ..EngineConfig::default()
    }
}

fn template() -> TemplateRef {
    TemplateRef {
        remote_id: TEMPLATE_ID,
        name: "ubuntu-2404-cloud".to_string(),
        os_hint: None,
        min_cpu_cores: 1,
        min_memory_bytes: GIB,
        min_disk_bytes: 10 * GIB,
    }
}

fn build_request(name: &str) -> CreateVmRequest {
    CreateVmRequest {
        name: name.to_string(),
        owner: "alice".to_string(),
        template: template(),
        resources: ResourceSpec {
            cpu_cores: 2,
            memory_bytes: 2 * GIB,
            disk_bytes: 10 * GIB,
        },
        credentials: None,
        ssh_keys: vec!["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIB alice@laptop".to_string()],
        address: None,
        disk_key: "scsi0".to_string(),
        remote_vm_id: None,
    }
}

async fn setup() -> (VmOrchestrator, Arc<MockGateway>) {
    setup_with(fast_config()).await
}

async fn setup_with(config: EngineConfig) -> (VmOrchestrator, Arc<MockGateway>) {
    let pool = create_test_db().await;
    let gateway = Arc::new(mock_cluster());
    let remote: Arc<dyn Gateway> = gateway.clone();
    (VmOrchestrator::new(pool, remote, config), gateway)
}

/// Put a VM named `name` on the cluster at `remote_id`, outside the engine.
async fn seed_remote_vm(gateway: &MockGateway, remote_id: u32, name: &str) {
    let options = CloneOptions {
        name: Some(name.to_string()),
        full: true,
        storage: None,
    };
    gateway
        .clone_vm(TEMPLATE_ID, remote_id, &options)
        .await
        .unwrap();
}

/// Create a VM and run its build to completion.
async fn built_vm(orchestrator: &VmOrchestrator, name: &str) -> String {
    let (vm, run) = orchestrator
        .create_vm(build_request(name))
        .await
        .expect("Failed to create VM");
    let status = orchestrator
        .sequencer()
        .drive(&run.id)
        .await
        .expect("Build should not error");
    assert_eq!(status, RunStatus::Completed);
    vm.id
}

/// Execute units of `run_id` until reaching `stop_at`, without executing it.
async fn run_until(orchestrator: &VmOrchestrator, run_id: &str, stop_at: u32) {
    let sequencer = orchestrator.sequencer();
    let mut position = 0;
    while position < stop_at {
        match sequencer.execute_step(run_id, position).await.unwrap() {
            StepOutcome::Advance(next) => position = next,
            other => panic!("Unexpected outcome at step {position}: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_build_happy_path() {
    let (orchestrator, gateway) = setup().await;

    let vm_id = built_vm(&orchestrator, "web-1").await;

    let vm = orchestrator.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert!(!vm.in_progress);
    assert!(vm.installed_at.is_some());
    assert!(vm.last_error.is_none());
    assert_eq!(vm.remote_vm_id, Some(100));
    assert_eq!(vm.resources.cpu_cores, 2);
    assert_eq!(vm.resources.memory_bytes, 2 * GIB);

    // Disk already at target: no resize call at all.
    assert_eq!(gateway.count(MockOp::Resize), 0);

    let remote = gateway.config_of(100).expect("Clone should exist");
    assert_eq!(remote.get("name"), Some("web-1"));
    assert_eq!(remote.get("cores"), Some("2"));
    assert_eq!(remote.get("memory"), Some("2048"));
    assert_eq!(remote.get("ciuser"), Some("ubuntu"));

    let runs = orchestrator.list_runs(Some(&vm_id), None).await.unwrap();
    assert_eq!(runs.len(), 1);
    let detail = orchestrator.get_run(&runs[0].id).await.unwrap();
    assert_eq!(detail.run.status, RunStatus::Completed);
    assert_eq!(detail.steps.len(), 10);
    assert!(detail
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed && s.attempts == 1));

    let progress = orchestrator.progress(&vm_id).await.unwrap().unwrap();
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.run_status, RunStatus::Completed);
}

#[tokio::test]
async fn test_build_lock_timeout_keeps_prior_status() {
    let (orchestrator, gateway) = setup().await;
    let (vm, run) = orchestrator.create_vm(build_request("web-1")).await.unwrap();

    // The post-clone lock never clears within the configured checks.
    gateway.script_locks(100, vec![Some("clone"); 5]);

    let status = orchestrator.sequencer().drive(&run.id).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    let detail = orchestrator.get_run(&run.id).await.unwrap();
    let error = detail.run.error.clone().unwrap();
    assert!(error.contains("still locked"), "unexpected error: {error}");
    assert_eq!(detail.steps[0].status, StepStatus::Completed);
    assert_eq!(detail.steps[1].status, StepStatus::Failed);
    assert!(detail.steps[2..]
        .iter()
        .all(|s| s.status == StepStatus::Pending && s.attempts == 0));

    let vm = orchestrator.get_vm(&vm.id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Provisioning);
    assert!(!vm.in_progress);
    assert!(vm.installed_at.is_none());
    assert!(vm.last_error.is_some());

    // The failed run never schedules anything past the failed step.
    let outcome = orchestrator
        .sequencer()
        .execute_step(&run.id, 2)
        .await
        .unwrap();
    assert_eq!(outcome, StepOutcome::Failed);
    assert_eq!(gateway.count(MockOp::UpdateConfig), 0);

    let leases = LeaseStore::new(orchestrator.pool().clone());
    assert!(leases.current(&vm.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rebuild_lock_timeout_restores_running() {
    let (orchestrator, gateway) = setup().await;
    let vm_id = built_vm(&orchestrator, "web-1").await;

    let run = orchestrator
        .rebuild(&vm_id, RebuildRequest::default())
        .await
        .unwrap();
    // Lock observations are only consumed once the clone exists again.
    gateway.script_locks(100, vec![Some("clone"); 5]);

    let status = orchestrator.sequencer().drive(&run.id).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    let detail = orchestrator.get_run(&run.id).await.unwrap();
    let failed = detail
        .steps
        .iter()
        .find(|s| s.status == StepStatus::Failed)
        .unwrap();
    assert_eq!(failed.name, StepKind::WaitCreated);

    let vm = orchestrator.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert!(!vm.in_progress);
}

#[tokio::test]
async fn test_guest_init_retries_through_lock_errors() {
    let (orchestrator, gateway) = setup().await;
    let (vm, run) = orchestrator.create_vm(build_request("web-1")).await.unwrap();

    // Position 6 is ConfigureGuestInit.
    run_until(&orchestrator, &run.id, 6).await;
    let updates_before = gateway.count(MockOp::UpdateConfig);
    gateway.fail_next(
        MockOp::UpdateConfig,
        (0..9)
            .map(|_| RemoteApiError::new(500, "VM 100 is locked (clone)"))
            .collect(),
    );

    let status = orchestrator.sequencer().drive(&run.id).await.unwrap();
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(gateway.count(MockOp::UpdateConfig) - updates_before, 10);

    let step = RunStore::new(orchestrator.pool().clone())
        .step(&run.id, 6)
        .await
        .unwrap();
    assert_eq!(step.name, StepKind::ConfigureGuestInit);
    assert_eq!(step.attempts, 1);
    assert!(step.output.unwrap().contains("attempt 10"));

    let vm = orchestrator.get_vm(&vm.id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert!(vm.last_error.is_none());
}

#[tokio::test]
async fn test_rebuild_with_missing_remote_vm_proceeds_to_clone() {
    let (orchestrator, gateway) = setup().await;
    let vm_id = built_vm(&orchestrator, "web-1").await;

    // Someone removed the VM behind our back.
    gateway.delete_vm(100).await.unwrap();
    let clones_before = gateway.count(MockOp::Clone);

    let run = orchestrator
        .rebuild(&vm_id, RebuildRequest::default())
        .await
        .unwrap();
    let status = orchestrator.sequencer().drive(&run.id).await.unwrap();
    assert_eq!(status, RunStatus::Completed);

    let detail = orchestrator.get_run(&run.id).await.unwrap();
    let delete = detail
        .steps
        .iter()
        .find(|s| s.name == StepKind::Delete)
        .unwrap();
    assert_eq!(delete.status, StepStatus::Completed);
    assert_eq!(delete.output.as_deref(), Some("already absent"));

    assert_eq!(gateway.count(MockOp::Clone), clones_before + 1);
    assert!(gateway.config_of(100).is_some());

    let vm = orchestrator.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert_eq!(vm.remote_vm_id, Some(100));
}

#[tokio::test]
async fn test_transient_step_failure_is_retried() {
    let (orchestrator, gateway) = setup().await;
    let (_, run) = orchestrator.create_vm(build_request("web-1")).await.unwrap();

    // Position 8 is PowerOn.
    run_until(&orchestrator, &run.id, 8).await;
    gateway.fail_next(
        MockOp::Power,
        vec![RemoteApiError::new(500, "internal server error")],
    );

    let sequencer = orchestrator.sequencer();
    let outcome = sequencer.execute_step(&run.id, 8).await.unwrap();
    assert_eq!(outcome, StepOutcome::Retry(Duration::from_secs(10)));

    let outcome = sequencer.execute_step(&run.id, 8).await.unwrap();
    assert_eq!(outcome, StepOutcome::Advance(9));

    let step = RunStore::new(orchestrator.pool().clone())
        .step(&run.id, 8)
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.attempts, 2);
}

#[tokio::test]
async fn test_pending_run_waits_for_foreign_lease() {
    let (orchestrator, _gateway) = setup().await;
    let (vm, run) = orchestrator.create_vm(build_request("web-1")).await.unwrap();

    let leases = LeaseStore::new(orchestrator.pool().clone());
    leases
        .acquire(&vm.id, "manual:ops", Duration::from_secs(60))
        .await
        .unwrap();

    let outcome = orchestrator
        .sequencer()
        .execute_step(&run.id, 0)
        .await
        .unwrap();
    assert!(matches!(outcome, StepOutcome::Retry(_)));

    let run = orchestrator.get_run(&run.id).await.unwrap().run;
    assert_eq!(run.status, RunStatus::Pending);
}

#[tokio::test]
async fn test_lease_blocks_manual_power_and_new_runs() {
    let (orchestrator, gateway) = setup().await;
    let vm_id = built_vm(&orchestrator, "web-1").await;

    let leases = LeaseStore::new(orchestrator.pool().clone());
    leases
        .acquire(&vm_id, "run:elsewhere", Duration::from_secs(60))
        .await
        .unwrap();

    let err = orchestrator
        .power(&vm_id, "bob", PowerAction::Stop)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::LeaseHeld { .. }));

    let err = orchestrator
        .rebuild(&vm_id, RebuildRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::LeaseHeld { .. }));

    leases.release(&vm_id, "run:elsewhere").await.unwrap();

    let vm = orchestrator
        .power(&vm_id, "bob", PowerAction::Stop)
        .await
        .unwrap();
    assert_eq!(vm.status, VmStatus::Stopped);
    assert!(vm.last_task.unwrap().contains("qmstop"));
    assert!(leases.current(&vm_id).await.unwrap().is_none());

    let vm = orchestrator
        .power(&vm_id, "bob", PowerAction::Start)
        .await
        .unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert_eq!(gateway.count(MockOp::Power), 3);
}

#[tokio::test]
async fn test_power_rejected_while_run_active() {
    let (orchestrator, _gateway) = setup().await;
    let vm_id = built_vm(&orchestrator, "web-1").await;

    orchestrator
        .rebuild(&vm_id, RebuildRequest::default())
        .await
        .unwrap();

    let err = orchestrator
        .power(&vm_id, "bob", PowerAction::Reboot)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));

    // One active run per VM.
    let err = orchestrator.delete(&vm_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));
}

#[tokio::test]
async fn test_delete_removes_remote_vm_and_record() {
    let (orchestrator, gateway) = setup().await;
    let vm_id = built_vm(&orchestrator, "web-1").await;

    let run = orchestrator.delete(&vm_id).await.unwrap();
    let status = orchestrator.sequencer().drive(&run.id).await.unwrap();
    assert_eq!(status, RunStatus::Completed);

    assert!(gateway.config_of(100).is_none());
    let err = orchestrator.get_vm(&vm_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    let leases = LeaseStore::new(orchestrator.pool().clone());
    assert!(leases.current(&vm_id).await.unwrap().is_none());

    // The run history outlives the record.
    let detail = orchestrator.get_run(&run.id).await.unwrap();
    assert!(detail.steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn test_resize_grows_disk_and_keeps_status() {
    let (orchestrator, gateway) = setup().await;
    let vm_id = built_vm(&orchestrator, "web-1").await;

    let target = ResourceSpec {
        cpu_cores: 4,
        memory_bytes: 4 * GIB,
        disk_bytes: 20 * GIB,
    };
    let run = orchestrator.resize(&vm_id, target).await.unwrap();
    let status = orchestrator.sequencer().drive(&run.id).await.unwrap();
    assert_eq!(status, RunStatus::Completed);

    assert_eq!(gateway.count(MockOp::Resize), 1);
    let vm = orchestrator.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.resources, target);
    assert_eq!(vm.status, VmStatus::Running);
    assert!(!vm.in_progress);
}

#[tokio::test]
async fn test_resize_rejects_shrinking_disk() {
    let (orchestrator, _gateway) = setup().await;
    let vm_id = built_vm(&orchestrator, "web-1").await;

    let err = orchestrator
        .resize(
            &vm_id,
            ResourceSpec {
                cpu_cores: 2,
                memory_bytes: 2 * GIB,
                disk_bytes: 5 * GIB,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidInput(_)));
}

#[tokio::test]
async fn test_create_rejects_resources_below_template_minimum() {
    let (orchestrator, _gateway) = setup().await;

    let mut req = build_request("tiny");
    req.resources.disk_bytes = GIB;
    let err = orchestrator.create_vm(req).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidInput(_)));

    let vms = orchestrator.list_vms(Default::default()).await.unwrap();
    assert!(vms.is_empty());
}

#[tokio::test]
async fn test_account_keys_reach_guest_init() {
    let (orchestrator, gateway) = setup().await;
    orchestrator
        .add_ssh_key("alice", "desktop", "ssh-rsa AAAAB3NzaC1yc2E alice@desktop")
        .await
        .unwrap();

    built_vm(&orchestrator, "web-1").await;

    let keys = gateway
        .config_of(100)
        .and_then(|c| c.get("sshkeys").map(str::to_string))
        .unwrap();
    assert!(keys.contains("alice%40laptop"));
    assert!(keys.contains("alice%40desktop"));
}

#[tokio::test]
async fn test_janitor_fails_orphaned_runs() {
    let (orchestrator, _gateway) = setup().await;
    let (vm, run) = orchestrator.create_vm(build_request("web-1")).await.unwrap();

    // Claimed by a worker that died before taking its lease.
    let runs = RunStore::new(orchestrator.pool().clone());
    assert!(runs.claim(&run.id).await.unwrap());

    let report = orchestrator.janitor_sweep().await.unwrap();
    assert_eq!(report.orphaned_runs, 1);

    let run = runs.get(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let vm = orchestrator.get_vm(&vm.id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Failed);
    assert!(!vm.in_progress);

    let report = orchestrator.janitor_sweep().await.unwrap();
    assert_eq!(report.orphaned_runs, 0);
}

#[tokio::test]
async fn test_dispatcher_runs_pending_builds() {
    let (orchestrator, _gateway) = setup().await;
    let (first, first_run) = orchestrator.create_vm(build_request("web-1")).await.unwrap();
    let (second, second_run) = orchestrator.create_vm(build_request("web-2")).await.unwrap();

    let dispatcher = Dispatcher::start(orchestrator.sequencer());
    assert_eq!(dispatcher.submit_pending().await.unwrap(), 2);
    // Already queued.
    assert!(!dispatcher.submit(&first_run.id).await.unwrap());

    for _ in 0..500 {
        if dispatcher.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dispatcher.in_flight(), 0);

    for (vm_id, run_id) in [(&first.id, &first_run.id), (&second.id, &second_run.id)] {
        let detail = orchestrator.get_run(run_id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
        let vm = orchestrator.get_vm(vm_id).await.unwrap();
        assert_eq!(vm.status, VmStatus::Running);
    }

    // Each VM got its own remote id.
    let first = orchestrator.get_vm(&first.id).await.unwrap();
    let second = orchestrator.get_vm(&second.id).await.unwrap();
    assert_ne!(first.remote_vm_id, second.remote_vm_id);

    dispatcher.shutdown();
}

#[tokio::test]
async fn test_create_rejects_remote_id_already_in_use() {
    let (orchestrator, gateway) = setup().await;
    seed_remote_vm(&gateway, 555, "someone-elses-db").await;

    let mut req = build_request("web-1");
    req.remote_vm_id = Some(555);
    let err = orchestrator.create_vm(req).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));

    assert!(orchestrator
        .list_vms(Default::default())
        .await
        .unwrap()
        .is_empty());
    let remote = gateway.config_of(555).unwrap();
    assert_eq!(remote.get("name"), Some("someone-elses-db"));
}

#[tokio::test]
async fn test_clone_refuses_foreign_vm_at_assigned_id() {
    let (orchestrator, gateway) = setup().await;
    let mut req = build_request("web-1");
    req.remote_vm_id = Some(555);
    let (vm, run) = orchestrator.create_vm(req).await.unwrap();

    // The id gets taken between accepting the request and cloning.
    seed_remote_vm(&gateway, 555, "someone-elses-db").await;

    let status = orchestrator.sequencer().drive(&run.id).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    let detail = orchestrator.get_run(&run.id).await.unwrap();
    assert_eq!(detail.steps[0].name, StepKind::Clone);
    assert_eq!(detail.steps[0].status, StepStatus::Failed);
    assert_eq!(detail.steps[0].attempts, 1);
    let error = detail.run.error.unwrap();
    assert!(error.contains("someone-elses-db"), "unexpected error: {error}");

    // The other VM is left exactly as it was.
    assert_eq!(gateway.count(MockOp::Clone), 1);
    assert_eq!(gateway.count(MockOp::UpdateConfig), 0);
    assert_eq!(gateway.count(MockOp::Power), 0);
    let remote = gateway.config_of(555).unwrap();
    assert_eq!(remote.get("name"), Some("someone-elses-db"));
    assert_eq!(remote.get("cores"), Some("1"));

    let vm = orchestrator.get_vm(&vm.id).await.unwrap();
    assert!(!vm.in_progress);
    assert!(vm.installed_at.is_none());
}

#[tokio::test]
async fn test_clone_adopts_its_own_earlier_clone() {
    let (orchestrator, gateway) = setup().await;
    let mut req = build_request("web-1");
    req.remote_vm_id = Some(555);
    let (vm, run) = orchestrator.create_vm(req).await.unwrap();

    // An earlier attempt dispatched the clone before losing track of it.
    seed_remote_vm(&gateway, 555, "web-1").await;

    let status = orchestrator.sequencer().drive(&run.id).await.unwrap();
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(gateway.count(MockOp::Clone), 1);

    let detail = orchestrator.get_run(&run.id).await.unwrap();
    assert_eq!(detail.steps[0].output.as_deref(), Some("VM 555 already present"));
    let remote = gateway.config_of(555).unwrap();
    assert_eq!(remote.get("cores"), Some("2"));

    let vm = orchestrator.get_vm(&vm.id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert_eq!(vm.remote_vm_id, Some(555));
}

#[tokio::test]
async fn test_dispatcher_does_not_hold_runs_behind_a_locked_vm() {
    let (orchestrator, gateway) = setup_with(EngineConfig {
        lock_wait_attempts: 10,
        lock_wait_interval_secs: 1,
        ..fast_config()
    })
    .await;

    let mut req = build_request("locked");
    req.remote_vm_id = Some(200);
    let (_, locked_run) = orchestrator.create_vm(req).await.unwrap();
    let mut req = build_request("free");
    req.remote_vm_id = Some(201);
    let (_, free_run) = orchestrator.create_vm(req).await.unwrap();

    // The first VM stays locked for a few seconds after its clone.
    gateway.script_locks(200, vec![Some("clone"); 3]);

    let dispatcher = Dispatcher::start(orchestrator.sequencer());
    assert_eq!(dispatcher.submit_pending().await.unwrap(), 2);

    let runs = RunStore::new(orchestrator.pool().clone());
    let mut free_status = RunStatus::Pending;
    for _ in 0..100 {
        free_status = runs.get(&free_run.id).await.unwrap().status;
        if free_status == RunStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(free_status, RunStatus::Completed);
    assert_eq!(
        runs.get(&locked_run.id).await.unwrap().status,
        RunStatus::Running
    );

    for _ in 0..100 {
        if dispatcher.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(
        runs.get(&locked_run.id).await.unwrap().status,
        RunStatus::Completed
    );

    dispatcher.shutdown();
}

#[tokio::test]
async fn test_long_step_keeps_run_lease_alive() {
    let (orchestrator, gateway) = setup_with(EngineConfig {
        lease_ttl_secs: 2,
        lock_wait_attempts: 6,
        lock_wait_interval_secs: 1,
        ..fast_config()
    })
    .await;
    let vm_id = built_vm(&orchestrator, "web-1").await;

    let target = ResourceSpec {
        cpu_cores: 4,
        memory_bytes: 4 * GIB,
        disk_bytes: 10 * GIB,
    };
    let run = orchestrator.resize(&vm_id, target).await.unwrap();
    // A backup holds the VM for longer than the lease TTL.
    gateway.script_locks(100, vec![Some("backup"); 4]);

    let sequencer = orchestrator.sequencer();
    let run_id = run.id.clone();
    let driver = tokio::spawn(async move { sequencer.drive(&run_id).await });

    tokio::time::sleep(Duration::from_secs(3)).await;
    let report = orchestrator.janitor_sweep().await.unwrap();
    assert_eq!(report.orphaned_runs, 0);

    let status = driver.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Completed);
    let vm = orchestrator.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.resources, target);
}
