//! Error types for the snapshot-and-publish workflow.
//!
//! Two layers:
//!
//! - [`EngineError`]: commit/push/save failures reported by a container
//!   engine. These are terminal for the request that triggered them and are
//!   surfaced verbatim as the status `reason`.
//! - [`Error`]: everything the reconciler, poller, selector, and cluster
//!   client can fail with. Only [`Error::is_transient`] errors are retried
//!   locally; the rest either advance the request to `Failed` or leave it
//!   unchanged pending a future event.

use std::time::Duration;

/// Result type alias for imagebuilder operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a container engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The container id is unknown to the engine.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The engine failed to snapshot the container.
    #[error("failed to commit container '{container}': {reason}")]
    CommitFailed { container: String, reason: String },

    /// The registry rejected the credentials.
    #[error("authentication failed for '{reference}': {reason}")]
    AuthFailed { reference: String, reason: String },

    /// The registry rejected the manifest/blob layout produced locally.
    #[error("registry rejected manifest for '{reference}': {reason}")]
    ManifestConflict { reference: String, reason: String },

    /// Any other push failure.
    #[error("failed to push '{reference}': {reason}")]
    PushFailed { reference: String, reason: String },

    /// Writing the image archive failed.
    #[error("failed to save '{reference}': {reason}")]
    SaveFailed { reference: String, reason: String },

    /// Signing the pushed image failed. Never rolls back the push.
    #[error("failed to sign '{reference}': {reason}")]
    SignFailed { reference: String, reason: String },

    /// The engine does not implement the operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// The destination reference cannot be used.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// The engine socket could not be reached.
    #[error("failed to connect to {socket}: {reason}")]
    Connect { socket: String, reason: String },

    /// The operation was cancelled before the engine finished.
    #[error("{0} cancelled")]
    Cancelled(String),
}

/// Errors that can occur while reconciling a request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    /// A required spec field is missing. Terminal, never retried.
    #[error("{0}")]
    Validation(String),

    /// A pod, node, job, or request was not found.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The node's container runtime is not supported.
    #[error("unsupported container runtime: {0}")]
    UnsupportedRuntime(String),

    /// Commit/push/save failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The delegated job failed or exhausted its backoff budget.
    #[error("job {name} failed: {message}")]
    Job { name: String, message: String },

    // =========================================================================
    // Cluster API Errors
    // =========================================================================
    /// Optimistic concurrency conflict on update.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The API server throttled the request.
    #[error("throttled: {0}")]
    Throttled(String),

    /// Any other cluster API failure.
    #[error("cluster API error: {0}")]
    Api(String),

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// The owning context was cancelled (shutdown).
    #[error("{0} cancelled")]
    Cancelled(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors eligible for silent local retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Throttled(_))
    }

    /// Returns true if the error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the error stems from cancellation rather than failure.
    ///
    /// Cancelled work must not be persisted as a terminal reason.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_) | Self::Engine(EngineError::Cancelled(_))
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
