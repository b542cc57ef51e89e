use tokio::time::{interval, Duration};
use tracing::{error, info};
use vm_orchestrator::VmOrchestrator;

/// Periodically fail runs whose worker died and drop expired leases.
pub async fn start_janitor_task(orchestrator: VmOrchestrator, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs.max(1)));

    info!(
        "Janitor task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        match orchestrator.janitor_sweep().await {
            Ok(report) if report.orphaned_runs > 0 => {
                info!("Janitor failed {} orphaned run(s)", report.orphaned_runs);
            }
            Ok(_) => {}
            Err(e) => error!("Janitor sweep failed: {}", e),
        }
    }
}
