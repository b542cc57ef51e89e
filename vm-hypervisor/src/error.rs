//! Error types for hypervisor gateway operations.
//!
//! Remote failures are classified exactly once, here, into [`RemoteErrorKind`].
//! Everything above the gateway dispatches on the kind and never inspects
//! the raw error text again.

use thiserror::Error;

/// Coarse classification of a remote API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The addressed VM, task or resource does not exist.
    NotFound,
    /// The VM configuration is locked by a remote asynchronous operation.
    LockHeld,
    /// The remote side gave up waiting (request or lock acquisition timeout).
    Timeout,
    /// The requested change is already in effect (disk already sized, VM already running).
    AlreadySatisfied,
    /// Parameters were rejected. Never worth retrying.
    Validation,
    Other,
}

impl RemoteErrorKind {
    /// Classify a non-success response from its HTTP status and raw body/reason text.
    pub fn classify(status: u16, text: &str) -> Self {
        let text = text.to_ascii_lowercase();

        if text.contains("smaller than")
            || text.contains("size match")
            || text.contains("already running")
            || text.contains("not running")
        {
            return Self::AlreadySatisfied;
        }
        if status == 404 || text.contains("does not exist") || text.contains("not found") {
            return Self::NotFound;
        }
        if text.contains("lock") {
            return Self::LockHeld;
        }
        if status == 408 || status == 504 || text.contains("timeout") || text.contains("timed out")
        {
            return Self::Timeout;
        }
        if status == 400 || text.contains("parameter verification failed") {
            return Self::Validation;
        }
        Self::Other
    }

    /// Lock and timeout errors are transient contention and may be retried.
    pub fn is_contention(self) -> bool {
        matches!(self, Self::LockHeld | Self::Timeout)
    }
}

/// A non-success HTTP response from the hypervisor API.
#[derive(Error, Debug, Clone)]
#[error("Remote API error ({status}): {message}")]
pub struct RemoteApiError {
    pub status: u16,
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = RemoteErrorKind::classify(status, &message);
        Self {
            status,
            message,
            kind,
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Remote(#[from] RemoteApiError),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Classification used by retry policies. Transport timeouts count as
    /// [`RemoteErrorKind::Timeout`]; other transport failures are `Other`.
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            GatewayError::Remote(e) => e.kind,
            GatewayError::Transport(e) if e.is_timeout() => RemoteErrorKind::Timeout,
            GatewayError::Transport(_) => RemoteErrorKind::Other,
            GatewayError::Decode(_) => RemoteErrorKind::Other,
            GatewayError::Config(_) => RemoteErrorKind::Validation,
        }
    }

    pub fn is_contention(&self) -> bool {
        self.kind().is_contention()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == RemoteErrorKind::NotFound
    }

    pub fn is_already_satisfied(&self) -> bool {
        self.kind() == RemoteErrorKind::AlreadySatisfied
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
