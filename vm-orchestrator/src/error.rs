use thiserror::Error;
use vm_hypervisor::{GatewayError, RemoteErrorKind, RemoteVmId, TaskHandle};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("VM {vm_id} is leased by {owner}")]
    LeaseHeld { vm_id: String, owner: String },

    #[error("Remote error: {0}")]
    Remote(#[from] GatewayError),

    #[error("Task {handle} failed: {exit_status}")]
    TaskFailed {
        handle: TaskHandle,
        exit_status: String,
    },

    #[error("Task {handle} still running after {timeout_secs}s")]
    TaskTimeout { handle: TaskHandle, timeout_secs: u64 },

    #[error("VM {vm} still locked after {attempts} checks")]
    LockTimeout { vm: RemoteVmId, attempts: u32 },

    #[error("Timed out waiting for VM {vm} to become {condition}")]
    WaitTimeout { vm: RemoteVmId, condition: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Lock and timeout failures mean the remote system was busy, not that
    /// the VM is broken.
    pub fn is_contention(&self) -> bool {
        match self {
            OrchestratorError::LockTimeout { .. } | OrchestratorError::TaskTimeout { .. } => true,
            OrchestratorError::Remote(e) => e.is_contention(),
            _ => false,
        }
    }

    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            OrchestratorError::Remote(e) => Some(e.kind()),
            _ => None,
        }
    }
}
