//! Executes run steps as independent units of work.
//!
//! Each unit is one attempt of one step and runs on its own task, so a run
//! sleeping through a remote lock or task poll never holds up another run.
//! Load on the cluster is bounded per request by the orchestrator's
//! [`ThrottledGateway`](crate::throttle::ThrottledGateway). When a step asks
//! to be retried, a detached timer re-enqueues it after the delay.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::sequencer::{Sequencer, StepOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
struct WorkUnit {
    run_id: String,
    position: u32,
}

pub struct Dispatcher {
    sequencer: Arc<Sequencer>,
    tx: mpsc::UnboundedSender<WorkUnit>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    runner: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the loop that spawns a task for every queued unit.
    pub fn start(sequencer: Arc<Sequencer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let runner = tokio::spawn(dispatch_loop(
            sequencer.clone(),
            rx,
            tx.clone(),
            in_flight.clone(),
        ));

        info!("Dispatcher started");

        Self {
            sequencer,
            tx,
            in_flight,
            runner,
        }
    }

    /// Queue `run_id` from its first unfinished step. Returns false if the
    /// run is already being worked on.
    pub async fn submit(&self, run_id: &str) -> Result<bool> {
        if !lock(&self.in_flight).insert(run_id.to_string()) {
            return Ok(false);
        }

        let position = match self.sequencer.next_position(run_id).await {
            Ok(position) => position,
            Err(e) => {
                lock(&self.in_flight).remove(run_id);
                return Err(e);
            }
        };

        debug!(run_id, position, "Run submitted");
        if self
            .tx
            .send(WorkUnit {
                run_id: run_id.to_string(),
                position,
            })
            .is_err()
        {
            lock(&self.in_flight).remove(run_id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Submit every pending run. Returns how many were newly queued.
    pub async fn submit_pending(&self) -> Result<usize> {
        let mut queued = 0;
        for run in self.sequencer.runs().pending().await? {
            if self.submit(&run.id).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    pub fn is_in_flight(&self, run_id: &str) -> bool {
        lock(&self.in_flight).contains(run_id)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Stop dispatching and abort every executing unit. Queued and scheduled
    /// units are dropped; their runs stay `running` until their lease expires
    /// and the janitor fails them.
    pub fn shutdown(self) {
        self.runner.abort();
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn dispatch_loop(
    sequencer: Arc<Sequencer>,
    mut rx: mpsc::UnboundedReceiver<WorkUnit>,
    tx: mpsc::UnboundedSender<WorkUnit>,
    in_flight: Arc<Mutex<HashSet<String>>>,
) {
    // Dropping the set on abort aborts the units with it.
    let mut units = JoinSet::new();
    loop {
        tokio::select! {
            unit = rx.recv() => match unit {
                Some(unit) => {
                    units.spawn(execute_unit(
                        unit,
                        sequencer.clone(),
                        tx.clone(),
                        in_flight.clone(),
                    ));
                }
                None => break,
            },
            Some(joined) = units.join_next() => {
                if let Err(e) = joined {
                    error!(error = %e, "Unit task panicked");
                }
            }
        }
    }
    while units.join_next().await.is_some() {}
}

async fn execute_unit(
    unit: WorkUnit,
    sequencer: Arc<Sequencer>,
    tx: mpsc::UnboundedSender<WorkUnit>,
    in_flight: Arc<Mutex<HashSet<String>>>,
) {
    debug!(run_id = %unit.run_id, position = unit.position, "Executing unit");

    match sequencer.execute_step(&unit.run_id, unit.position).await {
        Ok(StepOutcome::Advance(next)) => {
            let _ = tx.send(WorkUnit {
                run_id: unit.run_id,
                position: next,
            });
        }
        Ok(StepOutcome::Retry(delay)) => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(unit);
            });
        }
        Ok(StepOutcome::Finished) | Ok(StepOutcome::Failed) => {
            lock(&in_flight).remove(&unit.run_id);
        }
        Err(e) => {
            error!(run_id = %unit.run_id, error = %e, "Unit failed unexpectedly");
            if let Err(abort_err) = sequencer.abort(&unit.run_id, &e.to_string()).await {
                error!(run_id = %unit.run_id, error = %abort_err, "Could not abort run");
            }
            lock(&in_flight).remove(&unit.run_id);
        }
    }
}
