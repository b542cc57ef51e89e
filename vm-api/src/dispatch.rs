use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use vm_orchestrator::Dispatcher;

/// Periodically hand pending runs to the dispatcher's worker pool.
///
/// Runs enqueued through the API are picked up on the next tick; runs left
/// pending by a previous process are picked up on the first one.
pub async fn start_dispatch_task(dispatcher: Arc<Dispatcher>, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs.max(1)));

    info!(
        "Dispatch task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        match dispatcher.submit_pending().await {
            Ok(0) => {}
            Ok(queued) => debug!("Queued {} pending run(s)", queued),
            Err(e) => error!("Dispatch error: {}", e),
        }
    }
}
