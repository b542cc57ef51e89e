//! The run state machine.
//!
//! A run advances one step at a time. [`Sequencer::execute_step`] is the unit
//! of work: it runs a single attempt of one step and reports what should
//! happen next, so callers decide whether to continue inline ([`drive`]) or
//! hand the next unit to a worker pool.
//!
//! [`drive`]: Sequencer::drive

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use vm_hypervisor::{Gateway, RemoteErrorKind};

use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::keys::SshKeyStore;
use crate::lease::{run_owner, LeaseStore};
use crate::progress::ProgressTracker;
use crate::run::{Run, RunStatus, RunStore, StepStatus};
use crate::steps::{StepResult, StepRunner};
use crate::vm::{VmStatus, VmStore};
use crate::workflow::StepKind;

/// What should happen after one attempt of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step completed; execute `position` next.
    Advance(u32),
    /// The attempt failed but may be repeated after the delay.
    Retry(Duration),
    /// The run completed.
    Finished,
    /// The run failed.
    Failed,
}

enum RunStart {
    Started,
    /// The VM is leased by someone else; stay pending for this long.
    Wait(Duration),
    Lost,
}

/// Errors that retrying the same step cannot fix.
fn is_permanent(err: &OrchestratorError) -> bool {
    match err {
        OrchestratorError::TaskFailed { .. }
        | OrchestratorError::InvalidInput(_)
        | OrchestratorError::InvalidState(_)
        | OrchestratorError::NotFound(_)
        | OrchestratorError::LeaseHeld { .. }
        | OrchestratorError::Serialization(_) => true,
        OrchestratorError::Remote(e) => matches!(
            e.kind(),
            RemoteErrorKind::Validation | RemoteErrorKind::NotFound
        ),
        _ => false,
    }
}

pub struct Sequencer {
    runs: RunStore,
    vms: VmStore,
    leases: LeaseStore,
    progress: ProgressTracker,
    runner: StepRunner,
    config: EngineConfig,
}

impl Sequencer {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        runs: RunStore,
        vms: VmStore,
        leases: LeaseStore,
        keys: SshKeyStore,
        progress: ProgressTracker,
        config: EngineConfig,
    ) -> Self {
        let runner = StepRunner::new(gateway, vms.clone(), keys, progress.clone(), config.clone());
        Self {
            runs,
            vms,
            leases,
            progress,
            runner,
            config,
        }
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// First step of `run_id` that has not reached a terminal status.
    pub async fn next_position(&self, run_id: &str) -> Result<u32> {
        let steps = self.runs.steps(run_id).await?;
        Ok(steps
            .iter()
            .find(|s| !s.status.is_terminal())
            .or_else(|| steps.last())
            .map(|s| s.position)
            .unwrap_or_default())
    }

    /// Run one attempt of step `position` of `run_id`.
    #[instrument(skip(self), fields(step = tracing::field::Empty))]
    pub async fn execute_step(&self, run_id: &str, position: u32) -> Result<StepOutcome> {
        let mut run = self.runs.get(run_id).await?;

        let status = run.status;
        match status {
            RunStatus::Completed => return Ok(StepOutcome::Finished),
            RunStatus::Failed => return Ok(StepOutcome::Failed),
            RunStatus::Pending => match self.start_run(&run).await? {
                RunStart::Started => run = self.runs.get(run_id).await?,
                RunStart::Wait(delay) => return Ok(StepOutcome::Retry(delay)),
                // Another worker claimed it.
                RunStart::Lost => return Ok(StepOutcome::Finished),
            },
            RunStatus::Running => {}
        }

        let steps = self.runs.steps(run_id).await?;
        let last = steps.len().saturating_sub(1) as u32;
        let step = steps
            .get(position as usize)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("Step {position} of run {run_id}")))?;
        tracing::Span::current().record("step", step.name.as_str());

        match step.status {
            StepStatus::Completed | StepStatus::Skipped => {
                return if position >= last {
                    self.complete_run(&run).await
                } else {
                    Ok(StepOutcome::Advance(position + 1))
                };
            }
            StepStatus::Failed => return Ok(StepOutcome::Failed),
            StepStatus::Pending => {
                if let Some(previous) = position.checked_sub(1).and_then(|p| steps.get(p as usize)) {
                    if !matches!(previous.status, StepStatus::Completed | StepStatus::Skipped) {
                        return Err(OrchestratorError::InvalidState(format!(
                            "Step {position} of run {run_id} scheduled before step {} finished",
                            previous.position
                        )));
                    }
                }
                self.runs.start_step(run_id, position).await?;
            }
            StepStatus::Running => {}
        }

        let owner = run_owner(run_id);
        if let Err(e) = self
            .leases
            .renew(&run.vm_id, &owner, self.config.lease_ttl())
            .await
        {
            return self.fail(&run, position, &e).await;
        }

        let attempt = self.runs.record_attempt(run_id, position).await?;
        self.progress.refresh(&run.vm_id).await?;

        let policy = step.name.policy();
        debug!(attempt, max_attempts = policy.max_attempts, "Executing step");

        match self.perform_leased(&run, step.name).await {
            Ok(result) => {
                match result {
                    StepResult::Done(output) => {
                        self.runs
                            .complete_step(run_id, position, Some(&output))
                            .await?
                    }
                    StepResult::Skipped(reason) => {
                        self.runs.skip_step(run_id, position, &reason).await?
                    }
                }
                info!(attempt, "Step completed");

                if position >= last {
                    self.complete_run(&run).await
                } else {
                    self.progress.refresh(&run.vm_id).await?;
                    Ok(StepOutcome::Advance(position + 1))
                }
            }
            Err(e) if attempt < policy.max_attempts && !is_permanent(&e) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_secs = policy.backoff.as_secs(),
                    error = %e,
                    "Step failed, will retry"
                );
                self.runs
                    .note_step_error(run_id, position, &e.to_string())
                    .await?;
                Ok(StepOutcome::Retry(policy.backoff))
            }
            Err(e) => self.fail(&run, position, &e).await,
        }
    }

    /// Perform one attempt while renewing the run's lease, so a step that
    /// waits longer than the lease TTL is never mistaken for an orphan.
    async fn perform_leased(&self, run: &Run, step: StepKind) -> Result<StepResult> {
        let owner = run_owner(&run.id);
        let period = (self.config.lease_ttl() / 3).max(Duration::from_millis(100));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let work = self.runner.perform(run, step);
        tokio::pin!(work);
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => {
                    match self.leases.extend(&run.vm_id, &owner, self.config.lease_ttl()).await {
                        Ok(true) => {}
                        Ok(false) => warn!("Run lease lost while the step was executing"),
                        Err(e) => warn!(error = %e, "Could not extend run lease"),
                    }
                }
            }
        }
    }

    /// Take the run's lease and claim it.
    async fn start_run(&self, run: &Run) -> Result<RunStart> {
        let owner = run_owner(&run.id);
        match self
            .leases
            .acquire(&run.vm_id, &owner, self.config.lease_ttl())
            .await
        {
            Ok(_) => {}
            Err(OrchestratorError::LeaseHeld { owner: holder, .. }) => {
                debug!(holder = %holder, "VM leased, run stays pending");
                return Ok(RunStart::Wait(
                    self.config.lock_wait_interval().max(Duration::from_secs(1)),
                ));
            }
            Err(e) => return Err(e),
        }

        if !self.runs.claim(&run.id).await? {
            return Ok(RunStart::Lost);
        }

        self.vms
            .begin_operation(&run.vm_id, run.kind.transitional_status())
            .await?;
        info!(run_id = %run.id, vm_id = %run.vm_id, kind = run.kind.as_str(), "Run started");
        Ok(RunStart::Started)
    }

    async fn complete_run(&self, run: &Run) -> Result<StepOutcome> {
        match self.runs.complete_run(&run.id).await {
            Ok(()) | Err(OrchestratorError::InvalidState(_)) => {}
            Err(e) => return Err(e),
        }
        self.leases.release(&run.vm_id, &run_owner(&run.id)).await?;
        self.progress.refresh(&run.vm_id).await?;
        info!(run_id = %run.id, vm_id = %run.vm_id, kind = run.kind.as_str(), "Run completed");
        Ok(StepOutcome::Finished)
    }

    /// Fail the step, the run and the VM operation, then release the lease.
    /// Contention failures leave the VM in the status it had before the run.
    async fn fail(&self, run: &Run, position: u32, err: &OrchestratorError) -> Result<StepOutcome> {
        let message = err.to_string();
        error!(run_id = %run.id, vm_id = %run.vm_id, position, error = %message, "Step failed, aborting run");

        match self.runs.fail_step(&run.id, position, &message).await {
            Ok(()) | Err(OrchestratorError::InvalidState(_)) => {}
            Err(e) => return Err(e),
        }
        self.finish_failed(run, err.is_contention(), &message).await?;
        Ok(StepOutcome::Failed)
    }

    async fn finish_failed(&self, run: &Run, contention: bool, message: &str) -> Result<()> {
        match self.runs.fail_run(&run.id, message).await {
            Ok(()) | Err(OrchestratorError::InvalidState(_)) => {}
            Err(e) => return Err(e),
        }

        let status = if contention {
            run.prior_status
        } else {
            Some(VmStatus::Failed)
        };
        match self.vms.fail_operation(&run.vm_id, status, message).await {
            Ok(()) | Err(OrchestratorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.leases.release(&run.vm_id, &run_owner(&run.id)).await?;
        self.progress.refresh(&run.vm_id).await?;
        Ok(())
    }

    /// Fail a run from outside the step loop, e.g. when its worker vanished.
    pub async fn abort(&self, run_id: &str, reason: &str) -> Result<()> {
        let run = self.runs.get(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        for step in self.runs.steps(run_id).await? {
            if step.status == StepStatus::Running {
                match self.runs.fail_step(run_id, step.position, reason).await {
                    Ok(()) | Err(OrchestratorError::InvalidState(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        warn!(run_id, vm_id = %run.vm_id, reason, "Aborting run");
        self.finish_failed(&run, false, reason).await
    }

    /// Execute `run_id` to completion on the current task, sleeping through
    /// retry delays. Returns the final run status.
    pub async fn drive(&self, run_id: &str) -> Result<RunStatus> {
        let mut position = self.next_position(run_id).await?;
        loop {
            match self.execute_step(run_id, position).await? {
                StepOutcome::Advance(next) => position = next,
                StepOutcome::Retry(delay) => sleep(delay).await,
                StepOutcome::Finished | StepOutcome::Failed => {
                    return Ok(self.runs.get(run_id).await?.status)
                }
            }
        }
    }
}
