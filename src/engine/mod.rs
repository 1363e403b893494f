//! Image engine trait - commit/push/save over a node-local container runtime.
//!
//! Two structurally different engines sit behind one capability interface:
//!
//! - [`DaemonEngine`]: docker daemon over its unix socket. Commit pauses the
//!   container for the duration of the snapshot; the daemon handles push
//!   and archive export itself.
//! - [`SnapshotEngine`]: content-addressed store (containerd). Commit writes
//!   a new layer and image record without pausing; push is driven
//!   client-side and reduces multi-platform images to the platforms whose
//!   content exists locally.
//!
//! [`Engine`] is the closed variant type the runtime selector hands out.
//! Callers that want to substitute their own engine (tests) depend on
//! [`ImageEngine`] instead.
//!
//! # Lifecycle
//!
//! ```text
//! commit(container_id, reference) → push(reference, credentials)
//!                                 ↘ save(reference, archive_path)
//! ```

pub mod containerd;
pub mod daemon;
pub mod snapshot;

pub use self::daemon::DaemonEngine;
pub use self::snapshot::SnapshotEngine;

use crate::error::EngineError;
use crate::registry::RegistryCredentials;
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The two engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Daemon-socket engine (docker).
    Daemon,
    /// Snapshot/converter engine (containerd).
    Snapshot,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daemon => write!(f, "daemon"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Commit/push/save contract shared by all engines.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Returns the engine name for logs.
    fn name(&self) -> &str;

    /// Snapshots the container's filesystem into an image tagged `reference`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ContainerNotFound`] if the id is unknown
    /// - [`EngineError::CommitFailed`] for any other engine failure
    async fn commit(&self, container_id: &str, reference: &str) -> Result<(), EngineError>;

    /// Publishes a committed image to the registry implied by `reference`.
    ///
    /// Anonymous when `credentials.username` is empty.
    ///
    /// # Errors
    ///
    /// [`EngineError::AuthFailed`], [`EngineError::ManifestConflict`], and
    /// [`EngineError::PushFailed`] are reported distinctly.
    async fn push(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError>;

    /// Writes the image as a portable archive at `output`.
    ///
    /// Optional; engines that cannot export report `Unsupported`.
    async fn save(&self, reference: &str, output: &Path) -> Result<(), EngineError> {
        let _ = (reference, output);
        Err(EngineError::Unsupported(format!(
            "save not supported by {} engine",
            self.name()
        )))
    }
}

/// Engine selected for a node, holding its live runtime connection.
pub enum Engine {
    Daemon(DaemonEngine),
    Snapshot(SnapshotEngine),
}

impl Engine {
    /// Returns the engine family.
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Daemon(_) => EngineKind::Daemon,
            Self::Snapshot(_) => EngineKind::Snapshot,
        }
    }

    fn inner(&self) -> &dyn ImageEngine {
        match self {
            Self::Daemon(engine) => engine,
            Self::Snapshot(engine) => engine,
        }
    }
}

#[async_trait]
impl ImageEngine for Engine {
    fn name(&self) -> &str {
        self.inner().name()
    }

    async fn commit(&self, container_id: &str, reference: &str) -> Result<(), EngineError> {
        self.inner().commit(container_id, reference).await
    }

    async fn push(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError> {
        self.inner().push(reference, credentials).await
    }

    async fn save(&self, reference: &str, output: &Path) -> Result<(), EngineError> {
        self.inner().save(reference, output).await
    }
}

#[async_trait]
impl<T: ImageEngine + ?Sized> ImageEngine for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn commit(&self, container_id: &str, reference: &str) -> Result<(), EngineError> {
        (**self).commit(container_id, reference).await
    }

    async fn push(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError> {
        (**self).push(reference, credentials).await
    }

    async fn save(&self, reference: &str, output: &Path) -> Result<(), EngineError> {
        (**self).save(reference, output).await
    }
}

/// Runs an engine operation until it finishes or `cancel` fires.
///
/// Cancellation drops the operation and returns [`EngineError::Cancelled`],
/// never a registry-style failure.
pub async fn run_cancellable<T, F>(
    cancel: &CancellationToken,
    operation: &str,
    fut: F,
) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled(operation.to_string())),
        result = fut => result,
    }
}
