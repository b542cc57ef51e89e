//! VM lifecycle orchestration
//!
//! This crate drives multi-step workflows (build, rebuild, resize, delete)
//! against a hypervisor cluster. Every run is persisted as an ordered list of
//! steps, each retried within its own bounds. After a restart, pending runs
//! are submitted again; runs that were mid-step stay running until their
//! lease expires, and then the janitor fails them. It is consumed by the vm-api HTTP service but can also be
//! embedded by other entry points.

pub mod backoff;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod guest_init;
pub mod keys;
pub mod lease;
pub mod lock_wait;
pub mod orchestrator;
pub mod progress;
pub mod resources;
pub mod run;
pub mod sequencer;
pub mod steps;
pub mod task_monitor;
pub mod throttle;
pub mod vm;
pub mod workflow;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use backoff::BackoffSchedule;
pub use config::EngineConfig;
pub use dispatcher::Dispatcher;
pub use error::{OrchestratorError, Result};
pub use guest_init::{GuestCredentials, NetworkAddress};
pub use keys::SshKey;
pub use lease::Lease;
pub use orchestrator::{CreateVmRequest, RebuildRequest, SweepReport, VmOrchestrator};
pub use progress::ProgressSnapshot;
pub use run::{Run, RunDetail, RunParams, RunStatus, RunStep, StepStatus};
pub use sequencer::{Sequencer, StepOutcome};
pub use vm::{ResourceSpec, TemplateRef, VmFilters, VmRecord, VmStatus};
pub use workflow::{RunKind, StepKind};
