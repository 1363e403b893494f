//! `ImageBuilder` custom resource.
//!
//! A request names a source pod/container and a destination reference; the
//! status records lifecycle state, failure reason, and the node the work is
//! pinned to.
//!
//! # State Machine
//!
//! ```text
//!   ""  ──▶ Creating ──▶ Running ──▶ Succeeded
//!    │         │            │
//!    └─────────┴────────────┴──────▶ Failed
//! ```
//!
//! Transitions only move forward (see [`BuildState::can_transition_to`]);
//! `Succeeded` and `Failed` are sinks.

use crate::constants::{DEFAULT_NODE_SAVE_DIR, JOB_OUTPUT_DIR};
use crate::error::{Error, Result};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// Spec
// =============================================================================

/// What to do with the committed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Publish to the registry named by `to`.
    #[default]
    Push,
    /// Write an archive under `localHostPath` on the node.
    Save,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Save => write!(f, "save"),
        }
    }
}

/// Snapshot-and-publish request for one running container.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "imagebuilder.io",
    version = "v1",
    kind = "ImageBuilder",
    namespaced,
    status = "ImageBuilderStatus",
    shortname = "ib",
    printcolumn = r#"{"name":"PodName","type":"string","jsonPath":".spec.podName"}"#,
    printcolumn = r#"{"name":"PodNamespace","type":"string","jsonPath":".spec.namespace"}"#,
    printcolumn = r#"{"name":"ContainerName","type":"string","jsonPath":".spec.containerName"}"#,
    printcolumn = r#"{"name":"To","type":"string","jsonPath":".spec.to"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.node"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuilderSpec {
    /// Source pod name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    /// Source pod namespace (defaults to the request's namespace).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Container name within the pod.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    /// Registry username; anonymous when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Registry password.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Destination image reference.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    /// Push (default) or save.
    #[serde(default)]
    pub operator: Operator,
    /// Node directory for `save`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_host_path: Option<String>,
}

impl ImageBuilderSpec {
    /// Node directory receiving the archive for `save`.
    pub fn node_save_dir(&self) -> PathBuf {
        match self.local_host_path.as_deref() {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_NODE_SAVE_DIR),
        }
    }

    /// Mount point of [`Self::node_save_dir`] inside the delegated job.
    pub fn job_save_dir(&self) -> PathBuf {
        PathBuf::from(JOB_OUTPUT_DIR)
    }
}

impl ImageBuilder {
    /// Namespace of the source pod, falling back to the request's own.
    pub fn pod_namespace(&self) -> String {
        if self.spec.namespace.is_empty() {
            self.namespace().unwrap_or_default()
        } else {
            self.spec.namespace.clone()
        }
    }

    /// Current status, or the empty status of a new request.
    pub fn current_status(&self) -> ImageBuilderStatus {
        self.status.clone().unwrap_or_default()
    }
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum BuildState {
    /// New request, no pod located yet. Serialized as `""`.
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Pod located, node recorded.
    Creating,
    /// Work handed to a delegated job.
    Running,
    /// Image committed and published.
    Succeeded,
    /// Terminal failure, see `reason`.
    Failed,
}

impl BuildState {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Creating => 1,
            Self::Running => 2,
            Self::Succeeded | Self::Failed => 3,
        }
    }

    /// Returns true for `Succeeded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if moving to `next` keeps the state monotonic.
    pub fn can_transition_to(self, next: BuildState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, ""),
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome record owned by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImageBuilderStatus {
    /// Lifecycle state.
    #[serde(default)]
    pub state: BuildState,
    /// Failure detail, empty unless `state == Failed`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Node the work is pinned to; set once.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
}

// =============================================================================
// Object Key
// =============================================================================

/// Namespace/name of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Creates a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the key of a fetched request.
    pub fn from_resource(builder: &ImageBuilder) -> Result<Self> {
        let namespace = builder
            .namespace()
            .ok_or_else(|| Error::Internal(format!("{} has no namespace", builder.name_any())))?;
        Ok(Self::new(namespace, builder.name_any()))
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
