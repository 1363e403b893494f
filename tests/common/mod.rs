//! Shared fakes for integration tests.
//!
//! - [`FakeCluster`]: in-memory cluster with resourceVersion conflicts
//! - [`FakeEngine`]: records commit/push/save calls
//! - [`MemoryStore`] / [`RecordingTransport`]: snapshot engine backends

#![allow(dead_code)]

use async_trait::async_trait;
use imagebuilder::engine::snapshot::ContentStore;
use imagebuilder::registry::{repository_key, sha256_digest, RegistryTransport};
use imagebuilder::{
    BuildState, ClusterClient, EngineError, Error, ImageBuilder, ImageBuilderSpec,
    ImageBuilderStatus, ImageEngine, ObjectKey, RegistryCredentials, Result,
};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    ContainerStatus, Node, NodeStatus, NodeSystemInfo, Pod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::Reference;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// =============================================================================
// Fixtures
// =============================================================================

pub const NAMESPACE: &str = "default";
pub const REFERENCE: &str = "registry.local/img:v1";

pub fn spec(pod: &str, container: &str) -> ImageBuilderSpec {
    ImageBuilderSpec {
        pod_name: pod.to_string(),
        container_name: container.to_string(),
        to: REFERENCE.to_string(),
        ..Default::default()
    }
}

pub fn builder(name: &str, spec: ImageBuilderSpec) -> ImageBuilder {
    let mut builder = ImageBuilder::new(name, spec);
    builder.metadata.namespace = Some(NAMESPACE.to_string());
    builder
}

pub fn pod(name: &str, node: Option<&str>, container: &str, id: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            ..Default::default()
        }),
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: container.to_string(),
                container_id: id.map(str::to_string),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn node(name: &str, runtime: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                container_runtime_version: runtime.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Marks `job` with a `True` condition of `type_`.
pub fn finish_job(job: &mut Job, type_: &str, message: Option<&str>) {
    job.status = Some(JobStatus {
        conditions: Some(vec![JobCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            message: message.map(str::to_string),
            ..Default::default()
        }]),
        ..Default::default()
    });
}

// =============================================================================
// Fake Cluster
// =============================================================================

#[derive(Default)]
pub struct FakeCluster {
    builders: Mutex<HashMap<ObjectKey, ImageBuilder>>,
    pods: Mutex<HashMap<(String, String), Pod>>,
    nodes: Mutex<HashMap<String, Node>>,
    jobs: Mutex<HashMap<(String, String), Job>>,
    status_errors: Mutex<VecDeque<Error>>,
    job_errors: Mutex<VecDeque<Error>>,
    version: AtomicUsize,
    pub pod_lookups: AtomicUsize,
    pub status_writes: AtomicUsize,
    pub job_creates: AtomicUsize,
    pub job_deletes: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_builder(&self, mut builder: ImageBuilder) -> ObjectKey {
        builder.metadata.resource_version = Some(self.next_version());
        let key = ObjectKey::new(
            builder.namespace().unwrap_or_default(),
            builder.name_any(),
        );
        self.builders.lock().unwrap().insert(key.clone(), builder);
        key
    }

    /// Replaces the stored object as another writer would, bumping its
    /// resourceVersion.
    pub fn edit_builder(&self, key: &ObjectKey, edit: impl FnOnce(&mut ImageBuilder)) {
        let mut builders = self.builders.lock().unwrap();
        let builder = builders.get_mut(key).unwrap();
        edit(builder);
        builder.metadata.resource_version = Some(self.next_version());
    }

    pub fn remove_builder(&self, key: &ObjectKey) {
        self.builders.lock().unwrap().remove(key);
    }

    pub fn status(&self, key: &ObjectKey) -> ImageBuilderStatus {
        self.builders
            .lock()
            .unwrap()
            .get(key)
            .map(|b| b.current_status())
            .unwrap_or_default()
    }

    pub fn state(&self, key: &ObjectKey) -> BuildState {
        self.status(key).state
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        self.pods.lock().unwrap().insert(key, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.name_any(), node);
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn update_job(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut Job)) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&(namespace.to_string(), name.to_string())) {
            edit(job);
        }
    }

    pub fn remove_job(&self, namespace: &str, name: &str) {
        self.jobs
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Fails the next status writes with `errors`, in order.
    pub fn fail_status_writes(&self, errors: Vec<Error>) {
        self.status_errors.lock().unwrap().extend(errors);
    }

    /// Fails the next job creations with `errors`, in order.
    pub fn fail_job_creates(&self, errors: Vec<Error>) {
        self.job_errors.lock().unwrap().extend(errors);
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_builder(&self, key: &ObjectKey) -> Result<Option<ImageBuilder>> {
        Ok(self.builders.lock().unwrap().get(key).cloned())
    }

    async fn update_builder_status(
        &self,
        builder: &ImageBuilder,
        status: &ImageBuilderStatus,
    ) -> Result<ImageBuilder> {
        if let Some(err) = self.status_errors.lock().unwrap().pop_front() {
            return Err(err);
        }

        let key = ObjectKey::new(builder.namespace().unwrap_or_default(), builder.name_any());
        let mut builders = self.builders.lock().unwrap();
        let stored = builders.get_mut(&key).ok_or_else(|| Error::NotFound {
            kind: "imagebuilder",
            name: key.to_string(),
        })?;
        if stored.metadata.resource_version != builder.metadata.resource_version {
            return Err(Error::Conflict(format!("{} was modified", key)));
        }
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(self.next_version());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.pod_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.nodes.lock().unwrap().get(name).cloned())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.job(namespace, name))
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        if let Some(err) = self.job_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let key = (job.namespace().unwrap_or_default(), job.name_any());
        let labels = job.metadata.labels.clone().unwrap_or_default();
        if let Some((k, v)) = labels.iter().find(|(_, v)| v.len() > 63) {
            return Err(Error::Validation(format!(
                "metadata.labels: Invalid value: {:?}: must be no more than 63 characters ({})",
                v, k
            )));
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&key) {
            return Err(Error::Conflict(format!("job {} already exists", key.1)));
        }
        jobs.insert(key, job.clone());
        self.job_creates.fetch_add(1, Ordering::SeqCst);
        Ok(job.clone())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<bool> {
        self.job_deletes.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }
}

/// Sets a deletion timestamp on a stored request.
pub fn mark_deleting(cluster: &FakeCluster, key: &ObjectKey) {
    cluster.edit_builder(key, |b| {
        b.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    });
}

// =============================================================================
// Fake Engine
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Commit { container_id: String, reference: String },
    Push { reference: String, username: String },
    Save { reference: String, output: PathBuf },
}

#[derive(Default)]
pub struct FakeEngine {
    pub calls: Mutex<Vec<EngineCall>>,
    pub commit_error: Mutex<Option<EngineError>>,
    pub push_error: Mutex<Option<EngineError>>,
    /// Push never completes.
    pub hang_push: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hanging() -> Self {
        Self {
            hang_push: true,
            ..Default::default()
        }
    }

    pub fn failing_push(error: EngineError) -> Self {
        Self {
            push_error: Mutex::new(Some(error)),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn commit(&self, container_id: &str, reference: &str) -> std::result::Result<(), EngineError> {
        self.calls.lock().unwrap().push(EngineCall::Commit {
            container_id: container_id.to_string(),
            reference: reference.to_string(),
        });
        match self.commit_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn push(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> std::result::Result<(), EngineError> {
        self.calls.lock().unwrap().push(EngineCall::Push {
            reference: reference.to_string(),
            username: credentials.username.clone(),
        });
        if self.hang_push {
            std::future::pending::<()>().await;
        }
        match self.push_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn save(&self, reference: &str, output: &Path) -> std::result::Result<(), EngineError> {
        self.calls.lock().unwrap().push(EngineCall::Save {
            reference: reference.to_string(),
            output: output.to_path_buf(),
        });
        Ok(())
    }
}

// =============================================================================
// Snapshot Engine Backends
// =============================================================================

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const FOREIGN_LAYER: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// In-memory content store.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    images: Mutex<HashMap<String, OciDescriptor>>,
    pub commits: Mutex<Vec<(String, String)>>,
    pub deleted: Mutex<Vec<String>>,
    pub created: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` and returns its descriptor.
    pub fn add_blob(&self, data: &[u8], media_type: &str) -> OciDescriptor {
        let digest = sha256_digest(data);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.clone(), data.to_vec());
        descriptor(media_type, &digest, data.len())
    }

    /// Descriptor of content that is NOT in the store.
    pub fn missing_blob(&self, data: &[u8], media_type: &str) -> OciDescriptor {
        descriptor(media_type, &sha256_digest(data), data.len())
    }

    /// Stores a manifest over `config` and `layers` (which need not exist).
    pub fn add_manifest(&self, config: &OciDescriptor, layers: &[OciDescriptor]) -> OciDescriptor {
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": descriptor_json(config),
            "layers": layers.iter().map(descriptor_json).collect::<Vec<_>>(),
        });
        self.add_blob(&serde_json::to_vec(&body).unwrap(), OCI_MANIFEST)
    }

    /// Stores an index over `(manifest, "os/arch")` entries.
    pub fn add_index(&self, entries: &[(OciDescriptor, &str)]) -> OciDescriptor {
        let manifests: Vec<_> = entries
            .iter()
            .map(|(m, platform)| {
                let (os, arch) = platform.split_once('/').unwrap();
                serde_json::json!({
                    "mediaType": m.media_type,
                    "digest": m.digest,
                    "size": m.size,
                    "platform": { "os": os, "architecture": arch },
                })
            })
            .collect();
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": manifests,
        });
        self.add_blob(&serde_json::to_vec(&body).unwrap(), OCI_INDEX)
    }

    /// A complete single-platform image with one layer.
    pub fn add_image(&self, seed: &str) -> (OciDescriptor, Vec<String>) {
        let config = self.add_blob(format!("config-{seed}").as_bytes(), OCI_CONFIG);
        let layer = self.add_blob(format!("layer-{seed}").as_bytes(), OCI_LAYER);
        let manifest = self.add_manifest(&config, &[layer.clone()]);
        (manifest, vec![config.digest, layer.digest])
    }

    pub fn tag(&self, name: &str, target: &OciDescriptor) {
        self.images
            .lock()
            .unwrap()
            .insert(name.to_string(), target.clone());
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.images.lock().unwrap().contains_key(name)
    }

    pub fn blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn commit(&self, container_id: &str, reference: &str) -> std::result::Result<(), EngineError> {
        self.commits
            .lock()
            .unwrap()
            .push((container_id.to_string(), reference.to_string()));
        Ok(())
    }

    async fn image_target(&self, name: &str) -> std::result::Result<Option<OciDescriptor>, EngineError> {
        Ok(self.images.lock().unwrap().get(name).cloned())
    }

    async fn has_blob(&self, digest: &str) -> std::result::Result<bool, EngineError> {
        Ok(self.blobs.lock().unwrap().contains_key(digest))
    }

    async fn read_blob(&self, digest: &str) -> std::result::Result<Vec<u8>, EngineError> {
        self.blob(digest).ok_or_else(|| EngineError::PushFailed {
            reference: digest.to_string(),
            reason: "blob not found".to_string(),
        })
    }

    async fn write_blob(
        &self,
        data: Vec<u8>,
        media_type: &str,
        _references: &[String],
    ) -> std::result::Result<OciDescriptor, EngineError> {
        Ok(self.add_blob(&data, media_type))
    }

    async fn put_image(&self, name: &str, target: &OciDescriptor) -> std::result::Result<(), EngineError> {
        self.created.lock().unwrap().push(name.to_string());
        self.tag(name, target);
        Ok(())
    }

    async fn delete_image(&self, name: &str) -> std::result::Result<(), EngineError> {
        self.deleted.lock().unwrap().push(name.to_string());
        self.images.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Transport recording every upload.
#[derive(Default)]
pub struct RecordingTransport {
    /// `(repository, digest)` per uploaded blob.
    pub blobs: Mutex<Vec<(String, String)>>,
    /// `(repository, digest)` per mounted blob.
    pub mounts: Mutex<Vec<(String, String)>>,
    /// `(reference, media type, body)` per manifest.
    pub manifests: Mutex<Vec<(String, String, Vec<u8>)>>,
    /// Manifest pushes to fail with `ManifestConflict` before succeeding.
    pub conflicts: AtomicUsize,
    /// Reject every push as unauthorized.
    pub deny: bool,
    pub mount_fails: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_digests(&self) -> Vec<String> {
        self.blobs.lock().unwrap().iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn manifest_refs(&self) -> Vec<String> {
        self.manifests
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _, _)| r.clone())
            .collect()
    }

    pub fn unique_blobs(&self) -> HashSet<String> {
        self.blob_digests().into_iter().collect()
    }
}

#[async_trait]
impl RegistryTransport for RecordingTransport {
    async fn authenticate(
        &self,
        reference: &Reference,
        _credentials: &RegistryCredentials,
    ) -> std::result::Result<(), EngineError> {
        if self.deny {
            return Err(EngineError::AuthFailed {
                reference: reference.whole(),
                reason: "unauthorized".to_string(),
            });
        }
        Ok(())
    }

    async fn push_blob(
        &self,
        reference: &Reference,
        _data: &[u8],
        digest: &str,
    ) -> std::result::Result<(), EngineError> {
        self.blobs
            .lock()
            .unwrap()
            .push((repository_key(reference), digest.to_string()));
        Ok(())
    }

    async fn mount_blob(
        &self,
        reference: &Reference,
        _source: &Reference,
        digest: &str,
    ) -> std::result::Result<(), EngineError> {
        if self.mount_fails {
            return Err(EngineError::PushFailed {
                reference: reference.whole(),
                reason: "mount rejected".to_string(),
            });
        }
        self.mounts
            .lock()
            .unwrap()
            .push((repository_key(reference), digest.to_string()));
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &Reference,
        body: Vec<u8>,
        media_type: &str,
    ) -> std::result::Result<(), EngineError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::ManifestConflict {
                reference: reference.whole(),
                reason: "manifest blob unknown".to_string(),
            });
        }
        self.manifests
            .lock()
            .unwrap()
            .push((reference.whole(), media_type.to_string(), body));
        Ok(())
    }
}

fn descriptor(media_type: &str, digest: &str, size: usize) -> OciDescriptor {
    OciDescriptor {
        media_type: media_type.to_string(),
        digest: digest.to_string(),
        size: size as i64,
        urls: None,
        annotations: None,
    }
}

fn descriptor_json(d: &OciDescriptor) -> serde_json::Value {
    serde_json::json!({
        "mediaType": d.media_type,
        "digest": d.digest,
        "size": d.size,
    })
}
