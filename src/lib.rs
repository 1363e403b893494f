//! # imagebuilder
//!
//! **Snapshot a running container into an image and publish it.**
//!
//! A namespaced `ImageBuilder` custom resource names a pod, a container in
//! it, and a destination reference. The controller resolves the pod's node,
//! commits the live container on that node's runtime, and pushes the result
//! to a registry (or writes it as an archive on the node).
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          imagebuilder                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  controller ── watch ImageBuilder (+ labelled Jobs) ── work queue   │
//! │       │                                                             │
//! │  reconciler   "" → Creating → Running → Succeeded | Failed          │
//! │       │            (status writes guarded by StatusWriter)          │
//! │       ├── direct:    pipeline::execute on this node                 │
//! │       └── delegated: job::build_job → JobWatchers / JobPoller       │
//! │                                   │                                 │
//! │                     `job` process: pipeline::run_job                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  selector: node runtime id → Engine                                 │
//! │  ┌──────────────────────┐      ┌─────────────────────────────────┐  │
//! │  │ DaemonEngine         │      │ SnapshotEngine                  │  │
//! │  │ docker socket        │      │ ContentStore (containerd)       │  │
//! │  │ commit pauses        │      │ RegistryTransport (OCI)         │  │
//! │  │ daemon-side push     │      │ platform reduction, mounts,     │  │
//! │  │ archive export       │      │ optional signing                │  │
//! │  └──────────────────────┘      └─────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Execution Modes
//!
//! | Mode | Deployment | Commit/push runs in |
//! |------|------------|---------------------|
//! | `direct` | one controller per node | the controller, for its node only |
//! | `delegated` | one central controller | a privileged job pinned to the node |
//!
//! # Guarantees
//!
//! - Status only moves forward; `Succeeded` and `Failed` are final.
//! - `status.node` is written once, when the pod is first located.
//! - The container id is always re-resolved from the live pod.
//! - Cancellation on shutdown is never recorded as a failure.
//! - A finished delegated job is deleted at most once.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod engine;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod platform;
pub mod poller;
pub mod reconciler;
pub mod registry;
pub mod resource;
pub mod selector;
pub mod sign;
pub mod status;

// Re-exports
pub use cluster::{ClusterClient, KubeCluster};
pub use config::{ControllerConfig, EngineOptions, ExecutionMode, JobArgs, JobSettings};
pub use engine::{DaemonEngine, Engine, EngineKind, ImageEngine, SnapshotEngine};
pub use error::{EngineError, Error, Result};
pub use pipeline::{execute, run_job, ImageRequest};
pub use platform::{PlatformSet, PlatformSpec};
pub use poller::{JobOutcome, JobPoller, JobWatchers};
pub use reconciler::{Reconciler, Requeue};
pub use registry::{PushTracker, RegistryCredentials};
pub use resource::{
    BuildState, ImageBuilder, ImageBuilderSpec, ImageBuilderStatus, ObjectKey, Operator,
};
pub use selector::RuntimeKind;
pub use status::StatusWriter;
