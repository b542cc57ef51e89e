//! Progress reporting for UI polling.
//!
//! `run_steps` rows are the only persisted progress state. The tracker keeps
//! a short-lived cache of derived snapshots in front of them: the sequencer
//! writes through on every step transition, and a miss rebuilds the snapshot
//! from the VM's latest run.

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::run::{Run, RunStatus, RunStep, RunStore, StepStatus};
use crate::workflow::{RunKind, StepKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub vm_id: String,
    pub run_id: String,
    pub kind: RunKind,
    pub position: u32,
    pub step: StepKind,
    pub step_status: StepStatus,
    /// Percentage scraped from the current step's remote task log, if any.
    pub step_percent: Option<f64>,
    pub percent: u8,
    pub run_status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Derive a snapshot from a run and its step rows.
    pub fn from_rows(run: &Run, steps: &[RunStep]) -> Option<Self> {
        let current = match run.status {
            RunStatus::Completed => steps.last(),
            RunStatus::Failed => steps
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .or_else(|| steps.iter().find(|s| !s.status.is_terminal()))
                .or_else(|| steps.last()),
            RunStatus::Pending | RunStatus::Running => steps
                .iter()
                .find(|s| !s.status.is_terminal())
                .or_else(|| steps.last()),
        }?;

        let mut snapshot = Self {
            vm_id: run.vm_id.clone(),
            run_id: run.id.clone(),
            kind: run.kind,
            position: current.position,
            step: current.name,
            step_status: current.status,
            step_percent: None,
            percent: 0,
            run_status: run.status,
            updated_at: Utc::now(),
        };
        snapshot.percent = snapshot.compute_percent();
        Some(snapshot)
    }

    /// Weighted share of the workflow that is done. Steps before `position`
    /// count fully; the current one counts by its scraped task percentage,
    /// or fully once it is terminal.
    pub fn compute_percent(&self) -> u8 {
        if self.run_status == RunStatus::Completed {
            return 100;
        }

        let steps = self.kind.steps();
        let total: u32 = steps.iter().map(|s| s.weight()).sum();
        if total == 0 {
            return 0;
        }

        let position = self.position as usize;
        let done: u32 = steps.iter().take(position).map(|s| s.weight()).sum();

        let current_weight = f64::from(self.step.weight());
        let partial = match self.step_status {
            StepStatus::Completed | StepStatus::Skipped => current_weight,
            StepStatus::Running => {
                current_weight * self.step_percent.unwrap_or(0.0).clamp(0.0, 100.0) / 100.0
            }
            StepStatus::Pending | StepStatus::Failed => 0.0,
        };

        let percent = (f64::from(done) + partial) * 100.0 / f64::from(total);
        // A run is only 100% once it has completed.
        percent.floor().clamp(0.0, 99.0) as u8
    }
}

#[derive(Clone)]
pub struct ProgressTracker {
    runs: RunStore,
    cache: Cache<String, ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new(runs: RunStore, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { runs, cache }
    }

    /// Current progress for `vm_id`, reading through to the database on a miss.
    pub async fn get(&self, vm_id: &str) -> Result<Option<ProgressSnapshot>> {
        if let Some(snapshot) = self.cache.get(vm_id) {
            return Ok(Some(snapshot));
        }
        self.refresh(vm_id).await
    }

    /// Rebuild the snapshot for `vm_id` from its latest run and cache it.
    pub async fn refresh(&self, vm_id: &str) -> Result<Option<ProgressSnapshot>> {
        let Some(run) = self.runs.latest_for_vm(vm_id).await? else {
            self.cache.invalidate(vm_id);
            return Ok(None);
        };
        let steps = self.runs.steps(&run.id).await?;

        let snapshot = ProgressSnapshot::from_rows(&run, &steps);
        match &snapshot {
            Some(snapshot) => self.cache.insert(vm_id.to_string(), snapshot.clone()),
            None => self.cache.invalidate(vm_id),
        }
        Ok(snapshot)
    }

    /// Fold a scraped task percentage into the cached snapshot of `run_id`.
    /// Ignored when the cache holds nothing for that run.
    pub fn report_step_percent(&self, vm_id: &str, run_id: &str, percent: f64) {
        let Some(mut snapshot) = self.cache.get(vm_id) else {
            return;
        };
        if snapshot.run_id != run_id {
            return;
        }
        snapshot.step_percent = Some(percent);
        snapshot.percent = snapshot.compute_percent();
        snapshot.updated_at = Utc::now();
        self.cache.insert(vm_id.to_string(), snapshot);
    }

    pub fn invalidate(&self, vm_id: &str) {
        self.cache.invalidate(vm_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunParams;
    use crate::test_utils::create_test_db;
    use crate::vm::{ResourceSpec, VmStatus};
    use vm_hypervisor::GIB;

    fn params() -> RunParams {
        RunParams::for_target(ResourceSpec {
            cpu_cores: 1,
            memory_bytes: GIB,
            disk_bytes: 10 * GIB,
        })
    }

    #[tokio::test]
    async fn test_read_through_and_clone_percent() {
        let runs = RunStore::new(create_test_db().await);
        let tracker = ProgressTracker::new(runs.clone(), Duration::from_secs(60));

        assert!(tracker.get("vm-1").await.unwrap().is_none());

        let run = runs
            .create("vm-1", RunKind::Build, &params(), VmStatus::Provisioning)
            .await
            .unwrap();
        runs.claim(&run.id).await.unwrap();
        runs.start_step(&run.id, 0).await.unwrap();

        let snapshot = tracker.refresh("vm-1").await.unwrap().unwrap();
        assert_eq!(snapshot.step, StepKind::Clone);
        assert_eq!(snapshot.step_status, StepStatus::Running);
        assert_eq!(snapshot.percent, 0);

        // Clone carries 40 of the build's 78 weight units.
        tracker.report_step_percent("vm-1", &run.id, 50.0);
        let snapshot = tracker.get("vm-1").await.unwrap().unwrap();
        assert_eq!(snapshot.step_percent, Some(50.0));
        assert_eq!(snapshot.percent, 25);

        // Another run's report is ignored.
        tracker.report_step_percent("vm-1", "other-run", 90.0);
        assert_eq!(tracker.get("vm-1").await.unwrap().unwrap().percent, 25);
    }

    #[tokio::test]
    async fn test_percent_only_reaches_100_on_completion() {
        let runs = RunStore::new(create_test_db().await);
        let tracker = ProgressTracker::new(runs.clone(), Duration::from_secs(60));

        let run = runs
            .create("vm-1", RunKind::Resize, &params(), VmStatus::Running)
            .await
            .unwrap();
        runs.claim(&run.id).await.unwrap();
        for position in 0..RunKind::Resize.steps().len() as u32 {
            runs.start_step(&run.id, position).await.unwrap();
            runs.complete_step(&run.id, position, None).await.unwrap();
        }

        let before = tracker.refresh("vm-1").await.unwrap().unwrap();
        assert_eq!(before.step, StepKind::Finalize);
        assert_eq!(before.percent, 99);

        runs.complete_run(&run.id).await.unwrap();
        let after = tracker.refresh("vm-1").await.unwrap().unwrap();
        assert_eq!(after.run_status, RunStatus::Completed);
        assert_eq!(after.percent, 100);
    }

    #[tokio::test]
    async fn test_failed_run_points_at_failed_step() {
        let runs = RunStore::new(create_test_db().await);
        let tracker = ProgressTracker::new(runs.clone(), Duration::from_secs(60));

        let run = runs
            .create("vm-1", RunKind::Delete, &params(), VmStatus::Running)
            .await
            .unwrap();
        runs.claim(&run.id).await.unwrap();
        runs.start_step(&run.id, 0).await.unwrap();
        runs.complete_step(&run.id, 0, None).await.unwrap();
        runs.start_step(&run.id, 1).await.unwrap();
        runs.fail_step(&run.id, 1, "still running").await.unwrap();
        runs.fail_run(&run.id, "still running").await.unwrap();

        let snapshot = tracker.get("vm-1").await.unwrap().unwrap();
        assert_eq!(snapshot.step, StepKind::WaitStopped);
        assert_eq!(snapshot.step_status, StepStatus::Failed);
        assert_eq!(snapshot.run_status, RunStatus::Failed);
    }
}
