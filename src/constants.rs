//! # imagebuilder Constants
//!
//! Defines socket paths, timeouts, job limits, and media types used across
//! the crate. These constants are the **single source of truth** for values
//! that must agree between the controller, the delegated job descriptor, and
//! the delegated job process.
//!
//! ## Cross-References
//!
//! - [`crate::selector`]: Uses the runtime socket paths
//! - [`crate::job`]: Uses the socket paths, job limits, and labels
//! - [`crate::poller`]: Uses the poll interval and deadline
//! - [`crate::engine::snapshot`]: Uses the media types and temp-tag suffix
//! - [`crate::registry`]: Uses the reference limits

use std::time::Duration;

// =============================================================================
// Custom Resource
// =============================================================================

/// API group of the `ImageBuilder` custom resource.
pub const API_GROUP: &str = "imagebuilder.io";

/// API version of the `ImageBuilder` custom resource.
pub const API_VERSION: &str = "v1";

/// Name used for `app.kubernetes.io/managed-by` and log targets.
pub const MANAGER_NAME: &str = "imagebuilder";

// =============================================================================
// Runtime Sockets
// =============================================================================
//
// The delegated job mounts both sockets regardless of the node's runtime kind;
// the job process detects the kind itself, exactly as the controller does.
// =============================================================================

/// Runtime kind reported by docker nodes (`docker://<version>`).
pub const RUNTIME_KIND_DOCKER: &str = "docker";

/// Runtime kind reported by containerd nodes (`containerd://<version>`).
pub const RUNTIME_KIND_CONTAINERD: &str = "containerd";

/// Separator between kind and version in a node's runtime identifier.
pub const RUNTIME_ID_SEPARATOR: &str = "://";

/// Well-known docker daemon socket, identical on host and in the job container.
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Well-known containerd socket, identical on host and in the job container.
pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";

/// Containerd namespace holding kubelet-managed containers and images.
pub const CONTAINERD_NAMESPACE: &str = "k8s.io";

/// Timeout (seconds) for establishing the docker daemon connection.
pub const DOCKER_CONNECT_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// Save-to-disk
// =============================================================================

/// Node directory receiving saved archives when `localHostPath` is empty.
pub const DEFAULT_NODE_SAVE_DIR: &str = "/tmp/imagebuilder";

/// Mount point of the save directory inside the delegated job container.
pub const JOB_OUTPUT_DIR: &str = "/output";

/// File extension of saved image archives.
pub const ARCHIVE_EXTENSION: &str = "tar";

// =============================================================================
// Delegated Job
// =============================================================================
//
// The operation is I/O-bound (snapshot diff + upload), so the job gets a
// small fixed CPU/memory ceiling.
// =============================================================================

/// Default namespace for delegated jobs.
pub const DEFAULT_JOB_NAMESPACE: &str = "imagebuilder-system";

/// Default service account for delegated jobs.
pub const DEFAULT_JOB_SERVICE_ACCOUNT: &str = "imagebuilder-service-account";

/// Default container image for delegated jobs.
pub const DEFAULT_JOB_IMAGE: &str = "ghcr.io/imagebuilder/imagebuilder:latest";

/// Name of the single container in a delegated job.
pub const JOB_CONTAINER_NAME: &str = "imagebuild-job";

/// Retries the job controller performs before marking the job `Failed`.
///
/// Transient engine/registry errors self-heal without the reconciler
/// re-creating the job.
pub const JOB_BACKOFF_LIMIT: i32 = 3;

/// CPU limit for the delegated job container.
pub const JOB_CPU_LIMIT: &str = "128m";

/// Memory limit for the delegated job container.
pub const JOB_MEMORY_LIMIT: &str = "512Mi";

/// Maximum length of a Kubernetes object name (DNS-1123 label).
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Label carrying the managing component.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label carrying the owning request's name.
pub const LABEL_REQUEST_NAME: &str = "imagebuilder.io/name";

/// Label carrying the owning request's namespace.
pub const LABEL_REQUEST_NAMESPACE: &str = "imagebuilder.io/namespace";

/// Maximum length of a label value.
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Annotation carrying the owning request's exact name.
///
/// Label values are shortened past [`MAX_LABEL_VALUE_LEN`]; annotations are not.
pub const ANNOTATION_REQUEST_NAME: &str = "imagebuilder.io/request-name";

/// Annotation carrying the owning request's exact namespace.
pub const ANNOTATION_REQUEST_NAMESPACE: &str = "imagebuilder.io/request-namespace";

/// Directory the signing key secret is mounted at inside a delegated job.
pub const JOB_SIGNING_KEY_DIR: &str = "/etc/imagebuilder/signing";

/// Key file name used when the configured key path has none.
pub const DEFAULT_SIGNING_KEY_FILE: &str = "cosign.key";

// =============================================================================
// Timeouts and Intervals
// =============================================================================

/// Fixed interval between job status checks.
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Overall deadline for a delegated job to reach a terminal condition.
///
/// **Rationale**: Registry pushes of large images on slow links routinely
/// take many minutes; one hour bounds a stuck job without cutting off
/// legitimate uploads.
pub const JOB_POLL_DEADLINE: Duration = Duration::from_secs(3600);

/// Bound on a single in-process commit + push (direct execution).
pub const IMAGE_PUSH_TIMEOUT: Duration = Duration::from_secs(1800);

/// Requeue delay when a lookup (pod, job) comes back empty.
pub const LOOKUP_REQUEUE_DELAY: Duration = Duration::from_secs(15);

/// Requeue delay after a non-transient reconcile error.
pub const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Requeue delay after a transient cluster API error.
pub const TRANSIENT_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Attempts for a status write before a conflict is surfaced.
pub const STATUS_UPDATE_ATTEMPTS: u32 = 5;

/// Base backoff between status write attempts (doubled per attempt).
pub const STATUS_UPDATE_BACKOFF: Duration = Duration::from_millis(200);

/// Default number of requests reconciled concurrently.
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 4;

/// Bound on one `cosign sign` invocation.
pub const SIGN_TIMEOUT: Duration = Duration::from_secs(300);

/// Expiry of the containerd lease protecting freshly written commit content.
pub const COMMIT_LEASE_TTL: Duration = Duration::from_secs(3600);

// =============================================================================
// Image References and Media Types
// =============================================================================

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Characters allowed in image references.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789/:.-_@";

/// Suffix appended to the tag of the temporary reduced-platform image.
pub const REDUCED_PLATFORM_SUFFIX: &str = "-tmp-reduced-platform";

/// OCI image manifest.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index.
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Docker schema 2 manifest.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Docker schema 2 manifest list.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Layer media type produced by the containerd differ for commits.
pub const OCI_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Containerd content label holding a layer's uncompressed digest.
pub const UNCOMPRESSED_LABEL: &str = "containerd.io/uncompressed";

/// Prefix of containerd garbage-collection reference labels.
pub const GC_REF_CONTENT_PREFIX: &str = "containerd.io/gc.ref.content";

/// Containerd lease expiry label.
pub const GC_EXPIRE_LABEL: &str = "containerd.io/gc.expire";

/// Returns true for manifest list / image index media types.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
}

/// Returns true for single-platform manifest media types.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == OCI_MANIFEST_MEDIA_TYPE || media_type == DOCKER_MANIFEST_MEDIA_TYPE
}

/// Returns true for layers that registries must not receive (foreign layers).
pub fn is_non_distributable(media_type: &str) -> bool {
    media_type.contains("nondistributable") || media_type.contains("foreign")
}
