//! Delegated job descriptor.
//!
//! [`build_job`] is a pure function: request + node + container id in,
//! `batch/v1` Job out. The job:
//!
//! - runs one privileged, non-restarting container pinned to the node by
//!   `nodeName`, tolerating every taint
//! - mounts both runtime sockets (the job detects the runtime kind itself)
//! - mounts the node's save directory at `/output` for `save` requests
//! - passes `job --name --namespace --container-id`, enough to re-fetch the
//!   request, followed by the controller's engine flags
//! - mounts the signing key secret when images are signed
//! - carries labels and annotations that map job events back to the owning
//!   request

use crate::config::{EngineOptions, JobSettings};
use crate::constants::{
    ANNOTATION_REQUEST_NAME, ANNOTATION_REQUEST_NAMESPACE, DEFAULT_SIGNING_KEY_FILE,
    JOB_CONTAINER_NAME, JOB_SIGNING_KEY_DIR, LABEL_MANAGED_BY, LABEL_REQUEST_NAME,
    LABEL_REQUEST_NAMESPACE, MANAGER_NAME, MAX_JOB_NAME_LEN, MAX_LABEL_VALUE_LEN,
};
use crate::error::{Error, Result};
use crate::resource::{ImageBuilder, ObjectKey, Operator};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretVolumeSource, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DOCKER_SOCKET_VOLUME: &str = "docker-socket";
const CONTAINERD_SOCKET_VOLUME: &str = "containerd-socket";
const OUTPUT_VOLUME: &str = "output";
const SIGNING_KEY_VOLUME: &str = "signing-key";

/// Truncates `value` to `max` bytes, suffixed with a digest of the full
/// value so distinct inputs never collide.
fn shorten(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    let suffix = &digest[..10];
    let keep = max - suffix.len() - 1;
    let prefix = value[..keep].trim_end_matches(['-', '.', '_']);
    format!("{}-{}", prefix, suffix)
}

/// Job name for a request: `<namespace>-<name>`.
///
/// Names longer than a DNS label are truncated and suffixed with a digest of
/// the full name.
pub fn job_name(key: &ObjectKey) -> String {
    shorten(&format!("{}-{}", key.namespace, key.name), MAX_JOB_NAME_LEN)
}

/// Labels identifying the request a job belongs to.
///
/// Values are shortened to fit a label; use [`request_key`] to map back.
pub fn job_labels(key: &ObjectKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string()),
        (
            LABEL_REQUEST_NAME.to_string(),
            shorten(&key.name, MAX_LABEL_VALUE_LEN),
        ),
        (
            LABEL_REQUEST_NAMESPACE.to_string(),
            shorten(&key.namespace, MAX_LABEL_VALUE_LEN),
        ),
    ])
}

/// Annotations carrying the exact request key.
pub fn job_annotations(key: &ObjectKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ANNOTATION_REQUEST_NAME.to_string(), key.name.clone()),
        (ANNOTATION_REQUEST_NAMESPACE.to_string(), key.namespace.clone()),
    ])
}

/// Maps a job's metadata back to the owning request.
///
/// Jobs not managed by imagebuilder map to `None`. The exact key comes from
/// the annotations; labels are only used for jobs that carry none.
pub fn request_key(meta: &ObjectMeta) -> Option<ObjectKey> {
    let labels = meta.labels.as_ref()?;
    if labels.get(LABEL_MANAGED_BY).map(String::as_str) != Some(MANAGER_NAME) {
        return None;
    }
    let exact = meta.annotations.as_ref().and_then(|a| {
        Some(ObjectKey::new(
            a.get(ANNOTATION_REQUEST_NAMESPACE)?.clone(),
            a.get(ANNOTATION_REQUEST_NAME)?.clone(),
        ))
    });
    exact.or_else(|| {
        Some(ObjectKey::new(
            labels.get(LABEL_REQUEST_NAMESPACE)?.clone(),
            labels.get(LABEL_REQUEST_NAME)?.clone(),
        ))
    })
}

/// Path of the signing key inside the job.
pub fn job_signing_key_path(key: &Path) -> PathBuf {
    let file = key
        .file_name()
        .map(|f| f.to_os_string())
        .unwrap_or_else(|| DEFAULT_SIGNING_KEY_FILE.into());
    Path::new(JOB_SIGNING_KEY_DIR).join(file)
}

/// `job` flags re-encoding the controller's engine options.
pub fn engine_args(engine: &EngineOptions) -> Vec<String> {
    let mut args = vec![
        "--docker-socket".to_string(),
        engine.docker_socket.clone(),
        "--containerd-socket".to_string(),
        engine.containerd_socket.clone(),
        "--containerd-namespace".to_string(),
        engine.containerd_namespace.clone(),
        "--cosign-binary".to_string(),
        engine.cosign_binary.display().to_string(),
    ];
    if !engine.insecure_registry {
        args.push("--verify-registry-tls".to_string());
    }
    for registry in &engine.plain_http_registries {
        args.push("--plain-http-registry".to_string());
        args.push(registry.clone());
    }
    if let Some(key) = &engine.signing_key {
        args.push("--signing-key".to_string());
        args.push(job_signing_key_path(key).display().to_string());
    }
    args
}

/// Builds the delegated job for `builder` on `node`.
pub fn build_job(
    builder: &ImageBuilder,
    node: &str,
    container_id: &str,
    settings: &JobSettings,
    engine: &EngineOptions,
) -> Result<Job> {
    let key = ObjectKey::from_resource(builder)?;
    let labels = job_labels(&key);
    let annotations = job_annotations(&key);

    let mut mounts = vec![
        VolumeMount {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            mount_path: engine.docker_socket.clone(),
            ..Default::default()
        },
        VolumeMount {
            name: CONTAINERD_SOCKET_VOLUME.to_string(),
            mount_path: engine.containerd_socket.clone(),
            ..Default::default()
        },
    ];
    let mut volumes = vec![
        host_path_volume(DOCKER_SOCKET_VOLUME, &engine.docker_socket, None),
        host_path_volume(CONTAINERD_SOCKET_VOLUME, &engine.containerd_socket, None),
    ];

    if builder.spec.operator == Operator::Save {
        mounts.push(VolumeMount {
            name: OUTPUT_VOLUME.to_string(),
            mount_path: builder.spec.job_save_dir().display().to_string(),
            ..Default::default()
        });
        volumes.push(host_path_volume(
            OUTPUT_VOLUME,
            &builder.spec.node_save_dir().display().to_string(),
            Some("DirectoryOrCreate"),
        ));
    }

    if engine.signing_key.is_some() {
        let secret = settings.signing_key_secret.clone().ok_or_else(|| {
            Error::Config("signing is enabled but no signing key secret is set".to_string())
        })?;
        mounts.push(VolumeMount {
            name: SIGNING_KEY_VOLUME.to_string(),
            mount_path: JOB_SIGNING_KEY_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: SIGNING_KEY_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut args = vec![
        "job".to_string(),
        "--name".to_string(),
        key.name.clone(),
        "--namespace".to_string(),
        key.namespace.clone(),
        "--container-id".to_string(),
        container_id.to_string(),
    ];
    args.extend(engine_args(engine));

    let container = Container {
        name: JOB_CONTAINER_NAME.to_string(),
        image: Some(settings.image.clone()),
        image_pull_policy: Some(settings.image_pull_policy.clone()),
        args: Some(args),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(settings.cpu_limit.clone())),
                ("memory".to_string(), Quantity(settings.memory_limit.clone())),
            ])),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(&key)),
            namespace: Some(settings.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(settings.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        "sidecar.istio.io/inject".to_string(),
                        "false".to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(settings.service_account.clone()),
                    node_name: Some(node.to_string()),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn host_path_volume(name: &str, path: &str, type_: Option<&str>) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: type_.map(str::to_string),
        }),
        ..Default::default()
    }
}
