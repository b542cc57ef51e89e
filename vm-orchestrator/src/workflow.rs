//! Workflow declarations: which steps each run kind executes, in what order,
//! and how often each step may be retried.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::vm::VmStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Build,
    Rebuild,
    Resize,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Clone,
    WaitUnlocked,
    WaitCreated,
    ConfigureResources,
    ResizeDisk,
    ConfigureGuestInit,
    ConfigureVm,
    PowerOn,
    PowerOff,
    WaitStopped,
    Delete,
    WaitDeleted,
    WaitAgentReachable,
    MarkInstalled,
    Finalize,
}

impl RunKind {
    /// The fixed, declared order of steps for this workflow.
    pub fn steps(self) -> &'static [StepKind] {
        use StepKind::*;
        match self {
            RunKind::Build => &[
                Clone,
                WaitUnlocked,
                ConfigureResources,
                WaitUnlocked,
                ResizeDisk,
                WaitUnlocked,
                ConfigureGuestInit,
                WaitUnlocked,
                PowerOn,
                MarkInstalled,
            ],
            RunKind::Rebuild => &[
                PowerOff,
                WaitStopped,
                Delete,
                WaitDeleted,
                Clone,
                WaitCreated,
                ConfigureVm,
                PowerOn,
                WaitAgentReachable,
                Finalize,
            ],
            RunKind::Resize => &[
                WaitUnlocked,
                ConfigureResources,
                WaitUnlocked,
                ResizeDisk,
                Finalize,
            ],
            RunKind::Delete => &[PowerOff, WaitStopped, Delete, WaitDeleted, Finalize],
        }
    }

    /// Status a VM enters while this workflow runs. `None` leaves it unchanged.
    pub fn transitional_status(self) -> Option<VmStatus> {
        match self {
            RunKind::Build => Some(VmStatus::Provisioning),
            RunKind::Rebuild => Some(VmStatus::Rebuilding),
            RunKind::Delete => Some(VmStatus::Deleting),
            RunKind::Resize => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Build => "build",
            RunKind::Rebuild => "rebuild",
            RunKind::Resize => "resize",
            RunKind::Delete => "delete",
        }
    }
}

/// Bounded retry with a fixed backoff between attempts of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl StepPolicy {
    const fn new(max_attempts: u32, backoff_secs: u64) -> Self {
        Self {
            max_attempts,
            backoff: Duration::from_secs(backoff_secs),
        }
    }
}

impl StepKind {
    /// Wait steps, resize and guest-init run their own internal retry loops,
    /// so the step itself gets a single attempt.
    pub fn policy(self) -> StepPolicy {
        use StepKind::*;
        match self {
            Clone => StepPolicy::new(3, 30),
            ConfigureResources => StepPolicy::new(3, 10),
            PowerOn | PowerOff => StepPolicy::new(3, 10),
            Delete => StepPolicy::new(3, 15),
            MarkInstalled | Finalize => StepPolicy::new(3, 2),
            WaitUnlocked | WaitCreated | WaitStopped | WaitDeleted | WaitAgentReachable
            | ResizeDisk | ConfigureGuestInit | ConfigureVm => StepPolicy::new(1, 0),
        }
    }

    /// Relative share of a run's progress bar.
    pub fn weight(self) -> u32 {
        use StepKind::*;
        match self {
            Clone => 40,
            ConfigureVm => 15,
            ResizeDisk | ConfigureGuestInit | PowerOn => 8,
            Delete | PowerOff | ConfigureResources => 5,
            WaitAgentReachable => 5,
            WaitUnlocked | WaitCreated | WaitStopped | WaitDeleted => 2,
            MarkInstalled | Finalize => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        use StepKind::*;
        match self {
            Clone => "clone",
            WaitUnlocked => "wait_unlocked",
            WaitCreated => "wait_created",
            ConfigureResources => "configure_resources",
            ResizeDisk => "resize_disk",
            ConfigureGuestInit => "configure_guest_init",
            ConfigureVm => "configure_vm",
            PowerOn => "power_on",
            PowerOff => "power_off",
            WaitStopped => "wait_stopped",
            Delete => "delete",
            WaitDeleted => "wait_deleted",
            WaitAgentReachable => "wait_agent_reachable",
            MarkInstalled => "mark_installed",
            Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
