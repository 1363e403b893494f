//! Cluster API client.
//!
//! The reconciler, poller, and delegated job never construct API clients
//! themselves; they receive a [`ClusterClient`] and re-read current truth
//! through it on every pass. [`KubeCluster`] is the production
//! implementation over `kube`.

use crate::constants::RUNTIME_ID_SEPARATOR;
use crate::error::{Error, Result};
use crate::resource::{ImageBuilder, ImageBuilderStatus, ObjectKey};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

/// Typed access to the objects the workflow reads and writes.
///
/// Getters return `Ok(None)` for missing objects so callers can decide
/// whether absence is a retryable lookup miss or a terminal condition.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches a request.
    async fn get_builder(&self, key: &ObjectKey) -> Result<Option<ImageBuilder>>;

    /// Writes `status` onto the status subresource of `builder`.
    ///
    /// The write is conditional on `builder`'s resourceVersion and fails
    /// with [`Error::Conflict`] if the object changed since it was read.
    async fn update_builder_status(
        &self,
        builder: &ImageBuilder,
        status: &ImageBuilderStatus,
    ) -> Result<ImageBuilder>;

    /// Fetches a pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Fetches a node.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Fetches a job.
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Creates a job. An existing job with the same name is an error
    /// ([`Error::Conflict`]).
    async fn create_job(&self, job: &Job) -> Result<Job>;

    /// Deletes a job with background propagation.
    ///
    /// Returns `Ok(false)` if the job did not exist.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// [`ClusterClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wraps an already-configured client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects using the in-cluster config or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(map_kube_error)?;
        Ok(Self::new(client))
    }

    /// Returns the underlying client (for controller watches).
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn builders(&self, namespace: &str) -> Api<ImageBuilder> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_builder(&self, key: &ObjectKey) -> Result<Option<ImageBuilder>> {
        self.builders(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(map_kube_error)
    }

    async fn update_builder_status(
        &self,
        builder: &ImageBuilder,
        status: &ImageBuilderStatus,
    ) -> Result<ImageBuilder> {
        let key = ObjectKey::from_resource(builder)?;
        // Merge patch carrying resourceVersion: the API server rejects it with
        // 409 if another writer got there first.
        let patch = json!({
            "metadata": { "resourceVersion": builder.resource_version() },
            "status": status,
        });
        debug!(request = %key, state = %status.state, "patching status");
        self.builders(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_error)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Api::<Node>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Api::<Job>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let namespace = job
            .namespace()
            .ok_or_else(|| Error::Internal(format!("job {} has no namespace", job.name_any())))?;
        Api::<Job>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), job)
            .await
            .map_err(map_kube_error)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<bool> {
        match Api::<Job>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(map_kube_error(e)),
        }
    }
}

/// Maps a kube error onto the crate taxonomy.
///
/// 409 and 429 become transient; everything else is a plain API error.
pub fn map_kube_error(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 429 => Error::Throttled(ae.message),
        kube::Error::Api(ae) if ae.code == 422 => Error::Validation(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
            kind: "object",
            name: ae.message,
        },
        other => Error::Api(other.to_string()),
    }
}

/// Returns the node's runtime identifier (`<kind>://<version>`).
pub fn node_runtime_identifier(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|info| info.container_runtime_version.as_str())
        .filter(|id| !id.is_empty())
}

/// Fetches the runtime identifier advertised by node `name`.
///
/// A missing node is [`Error::NotFound`]; a node that reports no runtime is
/// [`Error::UnsupportedRuntime`] with an empty kind.
pub async fn runtime_identifier(client: &dyn ClusterClient, name: &str) -> Result<String> {
    let node = client.get_node(name).await?.ok_or_else(|| Error::NotFound {
        kind: "node",
        name: name.to_string(),
    })?;
    node_runtime_identifier(&node)
        .map(str::to_string)
        .ok_or_else(|| Error::UnsupportedRuntime(String::new()))
}

/// Returns the node a pod is scheduled on.
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

/// Resolves the runtime-local id of a container from the live pod.
///
/// Container statuses report `<kind>://<id>`; only `<id>` is returned.
/// `None` if the container has no status or has not been started yet.
pub fn container_id(pod: &Pod, container_name: &str) -> Option<String> {
    let status = pod
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == container_name)?;
    let raw = status.container_id.as_deref()?;
    let id = raw
        .split_once(RUNTIME_ID_SEPARATOR)
        .map_or(raw, |(_, id)| id);
    (!id.is_empty()).then(|| id.to_string())
}
