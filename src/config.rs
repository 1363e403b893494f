//! Process configuration.
//!
//! Plain structs with defaults from [`crate::constants`]; the binary maps
//! its command-line flags (and their environment fallbacks) onto them.

use crate::constants::{
    CONTAINERD_NAMESPACE, CONTAINERD_SOCKET, DEFAULT_JOB_IMAGE, DEFAULT_JOB_NAMESPACE,
    DEFAULT_JOB_SERVICE_ACCOUNT, DEFAULT_MAX_CONCURRENT_RECONCILES, DOCKER_SOCKET,
    JOB_BACKOFF_LIMIT, JOB_CPU_LIMIT, JOB_MEMORY_LIMIT, JOB_POLL_DEADLINE, JOB_POLL_INTERVAL,
};
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Execution Mode
// =============================================================================

/// Where commit/push runs. One mode per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// One controller per node; each commits containers on its own node
    /// in-process and ignores requests for pods elsewhere.
    Direct,
    /// A central controller submits a node-pinned job per request and
    /// watches it to completion.
    #[default]
    Delegated,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Delegated => write!(f, "delegated"),
        }
    }
}

// =============================================================================
// Engine Options
// =============================================================================

/// Runtime sockets and registry behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Docker daemon socket.
    pub docker_socket: String,
    /// Containerd socket.
    pub containerd_socket: String,
    /// Containerd namespace holding the kubelet's containers.
    pub containerd_namespace: String,
    /// Skip TLS certificate verification when pushing.
    ///
    /// Defaults to `true`: in-cluster registries commonly run with
    /// self-signed certificates. This is an operational trade-off, not a
    /// recommendation.
    pub insecure_registry: bool,
    /// Registries (host[:port]) reached over plain HTTP.
    pub plain_http_registries: Vec<String>,
    /// Cosign key; images are signed after push when set.
    pub signing_key: Option<PathBuf>,
    /// Cosign executable.
    pub cosign_binary: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            docker_socket: DOCKER_SOCKET.to_string(),
            containerd_socket: CONTAINERD_SOCKET.to_string(),
            containerd_namespace: CONTAINERD_NAMESPACE.to_string(),
            insecure_registry: true,
            plain_http_registries: Vec::new(),
            signing_key: None,
            cosign_binary: PathBuf::from("cosign"),
        }
    }
}

// =============================================================================
// Delegated Job Settings
// =============================================================================

/// Fixed parts of every delegated job descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    /// Namespace jobs are created in.
    pub namespace: String,
    /// Image running the `job` subcommand.
    pub image: String,
    /// Service account with read access to requests and nodes.
    pub service_account: String,
    /// Pull policy for [`Self::image`].
    pub image_pull_policy: String,
    /// Retries before the job is marked failed.
    pub backoff_limit: i32,
    /// CPU limit of the job container.
    pub cpu_limit: String,
    /// Memory limit of the job container.
    pub memory_limit: String,
    /// Secret holding the cosign key, mounted into jobs when signing is on.
    ///
    /// The secret must store the key under the file name of
    /// [`EngineOptions::signing_key`].
    pub signing_key_secret: Option<String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_JOB_NAMESPACE.to_string(),
            image: DEFAULT_JOB_IMAGE.to_string(),
            service_account: DEFAULT_JOB_SERVICE_ACCOUNT.to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            backoff_limit: JOB_BACKOFF_LIMIT,
            cpu_limit: JOB_CPU_LIMIT.to_string(),
            memory_limit: JOB_MEMORY_LIMIT.to_string(),
            signing_key_secret: None,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Configuration of the `controller` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub mode: ExecutionMode,
    /// Node this process runs on (required in direct mode).
    pub node_name: Option<String>,
    /// Restrict the watch to one namespace; all namespaces when `None`.
    pub watch_namespace: Option<String>,
    /// Requests reconciled concurrently.
    pub max_concurrent_reconciles: u16,
    /// Interval between job status checks.
    pub poll_interval: Duration,
    /// Overall bound on waiting for a job.
    pub poll_deadline: Duration,
    pub job: JobSettings,
    pub engine: EngineOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            node_name: None,
            watch_namespace: None,
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            poll_interval: JOB_POLL_INTERVAL,
            poll_deadline: JOB_POLL_DEADLINE,
            job: JobSettings::default(),
            engine: EngineOptions::default(),
        }
    }
}

impl ControllerConfig {
    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.mode == ExecutionMode::Direct
            && self.node_name.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::Config(
                "direct mode requires the node name (NODE_NAME)".to_string(),
            ));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::Config(
                "max concurrent reconciles must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        if self.poll_deadline < self.poll_interval {
            return Err(Error::Config(format!(
                "poll deadline {:?} is shorter than the poll interval {:?}",
                self.poll_deadline, self.poll_interval
            )));
        }
        if self.mode == ExecutionMode::Delegated
            && self.engine.signing_key.is_some()
            && self.job.signing_key_secret.is_none()
        {
            return Err(Error::Config(
                "delegated mode signs inside jobs and needs the signing key secret".to_string(),
            ));
        }
        if self.job.namespace.is_empty() || self.job.image.is_empty() {
            return Err(Error::Config(
                "job namespace and image must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Job
// =============================================================================

/// Arguments of the `job` subcommand run inside a delegated job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArgs {
    /// Request name.
    pub name: String,
    /// Request namespace.
    pub namespace: String,
    /// Runtime-local id of the container to commit.
    pub container_id: String,
}

impl JobArgs {
    /// Rejects missing identifiers before any API call is made.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("name is empty".to_string()));
        }
        if self.container_id.is_empty() {
            return Err(Error::Validation("containerID is empty".to_string()));
        }
        Ok(())
    }
}
