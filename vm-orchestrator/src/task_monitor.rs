//! Polling of remote task handles until they reach a terminal state.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};
use vm_hypervisor::{Gateway, TaskHandle, TaskStatus};

use crate::error::{OrchestratorError, Result};

/// Matches progress markers such as `(42.17%)` in remote task logs.
static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\((\d+(?:\.\d+)?)%\)").expect("Progress regex should compile - this is a static pattern")
});

/// Latest progress percentage found in a task log, if any.
pub fn scrape_percent(lines: &[String]) -> Option<f64> {
    lines.iter().rev().find_map(|line| {
        PROGRESS_RE
            .captures_iter(line)
            .last()
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    })
}

#[derive(Clone)]
pub struct TaskMonitor {
    gateway: Arc<dyn Gateway>,
    poll_interval: Duration,
}

impl TaskMonitor {
    pub fn new(gateway: Arc<dyn Gateway>, poll_interval: Duration) -> Self {
        Self {
            gateway,
            poll_interval,
        }
    }

    /// Wait for `handle` to stop. Returns only a stopped/OK status; a non-OK
    /// exit is `TaskFailed` and still running after `timeout` is `TaskTimeout`.
    pub async fn wait_for_task(&self, handle: &TaskHandle, timeout: Duration) -> Result<TaskStatus> {
        self.wait_inner(handle, timeout, None).await
    }

    /// Like [`wait_for_task`](Self::wait_for_task), also scraping the task log
    /// for a percentage between polls and passing it to `on_progress`.
    pub async fn wait_with_progress(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<TaskStatus> {
        self.wait_inner(handle, timeout, Some(on_progress)).await
    }

    #[instrument(skip(self, on_progress), fields(task = %handle))]
    async fn wait_inner(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
        on_progress: Option<&(dyn Fn(f64) + Send + Sync)>,
    ) -> Result<TaskStatus> {
        let started = Instant::now();

        loop {
            let status = self.gateway.task_status(handle).await?;

            if !status.is_running() {
                if status.is_success() {
                    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Task finished");
                    return Ok(status);
                }
                let exit_status = status.exit_status.unwrap_or_else(|| "unknown".to_string());
                warn!(exit_status = %exit_status, "Task failed");
                return Err(OrchestratorError::TaskFailed {
                    handle: handle.clone(),
                    exit_status,
                });
            }

            if started.elapsed() >= timeout {
                warn!(timeout_secs = timeout.as_secs(), "Task still running at timeout");
                return Err(OrchestratorError::TaskTimeout {
                    handle: handle.clone(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            if let Some(report) = on_progress {
                match self.gateway.task_log(handle).await {
                    Ok(lines) => {
                        if let Some(percent) = scrape_percent(&lines) {
                            report(percent);
                        }
                    }
                    Err(e) => debug!(error = %e, "Could not read task log"),
                }
            }

            sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vm_hypervisor::mock::{MockGateway, MockOp};
    use vm_hypervisor::RemoteApiError;

    fn handle() -> TaskHandle {
        TaskHandle::new("UPID:pve:0000AAAA:00000000:00000000:qmclone:101:root@pam:")
    }

    fn monitor(gateway: Arc<MockGateway>) -> TaskMonitor {
        TaskMonitor::new(gateway, Duration::from_secs(2))
    }

    #[test]
    fn test_scrape_percent_takes_latest_marker() {
        let lines = vec![
            "create full clone of drive scsi0 (local-lvm:base-9000-disk-0)".to_string(),
            "transferred 1.0 GiB of 10.0 GiB (10.00%)".to_string(),
            "transferred 4.2 GiB of 10.0 GiB (42.17%)".to_string(),
            "waiting for copy to finish".to_string(),
        ];
        assert_eq!(scrape_percent(&lines), Some(42.17));
        assert_eq!(scrape_percent(&["no progress here".to_string()]), None);
        assert_eq!(scrape_percent(&["done (100%)".to_string()]), Some(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_only_after_stopped_ok() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_task_statuses(vec![
            TaskStatus::running(),
            TaskStatus::running(),
            TaskStatus::stopped("OK"),
        ]);

        let started = Instant::now();
        let status = monitor(gateway.clone())
            .wait_for_task(&handle(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!status.is_running());
        assert!(status.is_success());
        assert_eq!(gateway.count(MockOp::TaskStatus), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_ok_exit_is_task_failed() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_task_statuses(vec![TaskStatus::stopped("unable to create VM 101")]);

        let err = monitor(gateway)
            .wait_for_task(&handle(), Duration::from_secs(60))
            .await
            .unwrap_err();

        match err {
            OrchestratorError::TaskFailed { exit_status, .. } => {
                assert_eq!(exit_status, "unable to create VM 101")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_while_running() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_task_statuses(vec![TaskStatus::running(); 100]);

        let err = monitor(gateway)
            .wait_for_task(&handle(), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::TaskTimeout { timeout_secs: 10, .. }
        ));
        assert!(err.is_contention());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_errors_propagate() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_next(
            MockOp::TaskStatus,
            vec![RemoteApiError::new(500, "no such task")],
        );

        let result = monitor(gateway)
            .wait_for_task(&handle(), Duration::from_secs(10))
            .await;
        assert!(matches!(result, Err(OrchestratorError::Remote(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_reported_between_polls() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_task_statuses(vec![TaskStatus::running(), TaskStatus::stopped("OK")]);
        gateway.set_task_log(vec!["transferred 5.0 GiB of 10.0 GiB (50.00%)"]);

        let seen = Mutex::new(Vec::new());
        monitor(gateway)
            .wait_with_progress(&handle(), Duration::from_secs(60), &|p: f64| {
                seen.lock().unwrap().push(p)
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![50.0]);
    }
}
