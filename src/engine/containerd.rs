//! Containerd content store.
//!
//! Implements [`ContentStore`] over the containerd gRPC API in the kubelet's
//! namespace (`k8s.io`).
//!
//! # Commit
//!
//! Containerd has no commit primitive; it is assembled from services:
//!
//! ```text
//! container ──▶ base image ──▶ manifest (host platform) + config
//!     │
//!     └─▶ snapshot ──stat──▶ parent
//!                              │
//!   lease ┬─ view(parent) ─────┴──▶ lower mounts
//!         ├─ mounts(snapshot) ─────▶ upper mounts
//!         ├─ diff(lower, upper) ───▶ new layer blob (+ uncompressed digest)
//!         ├─ write config  (diff_ids += layer, history += entry)
//!         ├─ write manifest (layers += layer, gc labels)
//!         └─ put image record `reference` → manifest
//! ```
//!
//! The container keeps running; the diff reads the active snapshot through
//! its mounts. The view snapshot and the lease are removed on every path.

use crate::constants::{
    is_index_media_type, COMMIT_LEASE_TTL, GC_EXPIRE_LABEL, GC_REF_CONTENT_PREFIX,
    OCI_LAYER_GZIP_MEDIA_TYPE, UNCOMPRESSED_LABEL,
};
use crate::engine::snapshot::ContentStore;
use crate::error::EngineError;
use crate::platform::PlatformSpec;
use crate::registry::sha256_digest;
use async_trait::async_trait;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::diff_client::DiffClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::leases_client::LeasesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    MountsRequest, RemoveSnapshotRequest, StatSnapshotRequest, ViewSnapshotRequest,
};
use containerd_client::services::v1::{
    Container, CreateImageRequest, CreateRequest, DeleteImageRequest, DeleteRequest, DiffRequest,
    GetContainerRequest, GetImageRequest, Image, InfoRequest, ReadContentRequest,
    UpdateImageRequest, WriteAction, WriteContentRequest,
};
use containerd_client::types::{Descriptor, Mount};
use oci_distribution::manifest::{OciDescriptor, OciImageIndex};
use serde_json::{json, Value};
use std::collections::HashMap;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use tracing::{debug, info, warn};

const NAMESPACE_HEADER: &str = "containerd-namespace";
const LEASE_HEADER: &str = "containerd-lease";

/// [`ContentStore`] over a containerd socket.
#[derive(Clone)]
pub struct ContainerdStore {
    channel: Channel,
    namespace: AsciiMetadataValue,
    platform: PlatformSpec,
}

impl ContainerdStore {
    /// Connects to `socket` and scopes all calls to `namespace`.
    pub async fn connect(socket: &str, namespace: &str) -> Result<Self, EngineError> {
        let connect_err = |reason: String| EngineError::Connect {
            socket: socket.to_string(),
            reason,
        };

        let namespace = AsciiMetadataValue::try_from(namespace)
            .map_err(|e| connect_err(format!("invalid namespace {}: {}", namespace, e)))?;
        let channel = containerd_client::connect(socket)
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        info!(socket, "connected to containerd");
        Ok(Self {
            channel,
            namespace,
            platform: PlatformSpec::host(),
        })
    }

    fn request<T>(&self, message: T, lease: Option<&AsciiMetadataValue>) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(NAMESPACE_HEADER, self.namespace.clone());
        if let Some(lease) = lease {
            request.metadata_mut().insert(LEASE_HEADER, lease.clone());
        }
        request
    }

    // =========================================================================
    // Leases
    // =========================================================================

    async fn create_lease(&self) -> Result<(String, AsciiMetadataValue), String> {
        let id = format!("imagebuilder-{}", uuid::Uuid::new_v4());
        let expire = chrono::Utc::now()
            + chrono::Duration::from_std(COMMIT_LEASE_TTL).map_err(|e| e.to_string())?;
        let labels = HashMap::from([(
            GC_EXPIRE_LABEL.to_string(),
            expire.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )]);

        LeasesClient::new(self.channel.clone())
            .create(self.request(
                CreateRequest {
                    id: id.clone(),
                    labels,
                },
                None,
            ))
            .await
            .map_err(|s| status_reason("create lease", s))?;

        let header = AsciiMetadataValue::try_from(id.as_str()).map_err(|e| e.to_string())?;
        Ok((id, header))
    }

    async fn delete_lease(&self, id: &str) {
        let result = LeasesClient::new(self.channel.clone())
            .delete(self.request(
                DeleteRequest {
                    id: id.to_string(),
                    sync: false,
                },
                None,
            ))
            .await;
        if let Err(status) = result {
            warn!(lease = id, error = %status.message(), "failed to delete lease");
        }
    }

    // =========================================================================
    // Content
    // =========================================================================

    async fn read(&self, digest: &str) -> Result<Vec<u8>, Status> {
        let mut stream = ContentClient::new(self.channel.clone())
            .read(self.request(
                ReadContentRequest {
                    digest: digest.to_string(),
                    ..Default::default()
                },
                None,
            ))
            .await?
            .into_inner();

        let mut data = Vec::new();
        while let Some(chunk) = stream.message().await? {
            data.extend_from_slice(&chunk.data);
        }
        Ok(data)
    }

    async fn write(
        &self,
        data: Vec<u8>,
        media_type: &str,
        labels: HashMap<String, String>,
        lease: Option<&AsciiMetadataValue>,
    ) -> Result<OciDescriptor, Status> {
        let digest = sha256_digest(&data);
        let size = data.len() as i64;
        let message = WriteContentRequest {
            action: WriteAction::Commit as i32,
            r#ref: format!("imagebuilder-{}", digest),
            total: size,
            expected: digest.clone(),
            data,
            labels,
            ..Default::default()
        };

        let request = self.request(tokio_stream::iter(vec![message]), lease);
        match ContentClient::new(self.channel.clone()).write(request).await {
            Ok(response) => {
                let mut stream = response.into_inner();
                loop {
                    match stream.message().await {
                        Ok(Some(_)) => continue,
                        Ok(None) => break,
                        Err(s) if s.code() == Code::AlreadyExists => break,
                        Err(s) => return Err(s),
                    }
                }
            }
            Err(s) if s.code() == Code::AlreadyExists => {}
            Err(s) => return Err(s),
        }

        debug!(digest, media_type, "wrote content");
        Ok(OciDescriptor {
            media_type: media_type.to_string(),
            digest,
            size,
            urls: None,
            annotations: None,
        })
    }

    async fn labels_of(&self, digest: &str) -> Result<HashMap<String, String>, Status> {
        let info = ContentClient::new(self.channel.clone())
            .info(self.request(
                InfoRequest {
                    digest: digest.to_string(),
                },
                None,
            ))
            .await?
            .into_inner()
            .info;
        Ok(info.map(|i| i.labels).unwrap_or_default())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    async fn get_container(&self, container_id: &str) -> Result<Container, EngineError> {
        let response = ContainersClient::new(self.channel.clone())
            .get(self.request(
                GetContainerRequest {
                    id: container_id.to_string(),
                },
                None,
            ))
            .await;
        match response {
            Ok(r) => r
                .into_inner()
                .container
                .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string())),
            Err(s) if s.code() == Code::NotFound => {
                Err(EngineError::ContainerNotFound(container_id.to_string()))
            }
            Err(s) => Err(EngineError::CommitFailed {
                container: container_id.to_string(),
                reason: status_reason("get container", s),
            }),
        }
    }

    /// Resolves the base image to the manifest for this node's platform.
    async fn base_manifest(&self, image: &str) -> Result<OciDescriptor, String> {
        let target = self
            .image_target(image)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("base image {} not found", image))?;

        if !is_index_media_type(&target.media_type) {
            return Ok(target);
        }

        let body = self
            .read(&target.digest)
            .await
            .map_err(|s| status_reason("read index", s))?;
        let index: OciImageIndex =
            serde_json::from_slice(&body).map_err(|e| format!("malformed index: {}", e))?;

        index
            .manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| PlatformSpec::from_oci(p).matches(&self.platform))
            })
            .map(|m| OciDescriptor {
                media_type: m.media_type.clone(),
                digest: m.digest.clone(),
                size: m.size,
                urls: None,
                annotations: None,
            })
            .ok_or_else(|| format!("base image {} has no manifest for {}", image, self.platform))
    }

    async fn commit_leased(
        &self,
        container: &Container,
        reference: &str,
        lease: &AsciiMetadataValue,
        view_key: &str,
    ) -> Result<(), String> {
        let base = self.base_manifest(&container.image).await?;
        let mut manifest = self.read_json(&base.digest).await?;
        let config_digest = manifest["config"]["digest"]
            .as_str()
            .ok_or("base manifest has no config")?
            .to_string();
        let config_media_type = manifest["config"]["mediaType"]
            .as_str()
            .ok_or("base manifest config has no media type")?
            .to_string();
        let mut config = self.read_json(&config_digest).await?;

        let mut snapshots = SnapshotsClient::new(self.channel.clone());
        let parent = snapshots
            .stat(self.request(
                StatSnapshotRequest {
                    snapshotter: container.snapshotter.clone(),
                    key: container.snapshot_key.clone(),
                },
                None,
            ))
            .await
            .map_err(|s| status_reason("stat snapshot", s))?
            .into_inner()
            .info
            .map(|i| i.parent)
            .unwrap_or_default();

        let lower: Vec<Mount> = if parent.is_empty() {
            Vec::new()
        } else {
            snapshots
                .view(self.request(
                    ViewSnapshotRequest {
                        snapshotter: container.snapshotter.clone(),
                        key: view_key.to_string(),
                        parent,
                        ..Default::default()
                    },
                    Some(lease),
                ))
                .await
                .map_err(|s| status_reason("view parent snapshot", s))?
                .into_inner()
                .mounts
        };

        let upper = snapshots
            .mounts(self.request(
                MountsRequest {
                    snapshotter: container.snapshotter.clone(),
                    key: container.snapshot_key.clone(),
                },
                None,
            ))
            .await
            .map_err(|s| status_reason("container snapshot mounts", s))?
            .into_inner()
            .mounts;

        let layer = DiffClient::new(self.channel.clone())
            .diff(self.request(
                DiffRequest {
                    left: lower,
                    right: upper,
                    media_type: OCI_LAYER_GZIP_MEDIA_TYPE.to_string(),
                    r#ref: format!("imagebuilder-diff-{}", uuid::Uuid::new_v4()),
                    ..Default::default()
                },
                Some(lease),
            ))
            .await
            .map_err(|s| status_reason("diff snapshot", s))?
            .into_inner()
            .diff
            .ok_or("differ returned no layer")?;

        let diff_id = self
            .labels_of(&layer.digest)
            .await
            .map_err(|s| status_reason("layer info", s))?
            .remove(UNCOMPRESSED_LABEL)
            .ok_or("layer has no uncompressed digest")?;
        debug!(digest = %layer.digest, diff_id, "created layer");

        append_layer_to_config(&mut config, &diff_id, reference);
        let config_body = serde_json::to_vec(&config).map_err(|e| e.to_string())?;
        let config_desc = self
            .write(config_body, &config_media_type, HashMap::new(), Some(lease))
            .await
            .map_err(|s| status_reason("write config", s))?;

        let labels = append_layer_to_manifest(&mut manifest, &config_desc, &layer)?;
        let manifest_body = serde_json::to_vec(&manifest).map_err(|e| e.to_string())?;
        let manifest_desc = self
            .write(manifest_body, &base.media_type, labels, Some(lease))
            .await
            .map_err(|s| status_reason("write manifest", s))?;

        self.put_image(reference, &manifest_desc)
            .await
            .map_err(|e| e.to_string())?;
        info!(reference, digest = %manifest_desc.digest, "committed container");
        Ok(())
    }

    async fn read_json(&self, digest: &str) -> Result<Value, String> {
        let body = self
            .read(digest)
            .await
            .map_err(|s| status_reason("read content", s))?;
        serde_json::from_slice(&body).map_err(|e| format!("malformed {}: {}", digest, e))
    }

    async fn remove_view(&self, snapshotter: &str, key: &str) {
        let result = SnapshotsClient::new(self.channel.clone())
            .remove(self.request(
                RemoveSnapshotRequest {
                    snapshotter: snapshotter.to_string(),
                    key: key.to_string(),
                },
                None,
            ))
            .await;
        match result {
            Ok(_) => {}
            Err(s) if s.code() == Code::NotFound => {}
            Err(s) => warn!(key, error = %s.message(), "failed to remove view snapshot"),
        }
    }
}

#[async_trait]
impl ContentStore for ContainerdStore {
    async fn commit(&self, container_id: &str, reference: &str) -> Result<(), EngineError> {
        let commit_err = |reason: String| EngineError::CommitFailed {
            container: container_id.to_string(),
            reason,
        };

        let container = self.get_container(container_id).await?;
        debug!(
            container_id,
            image = %container.image,
            snapshotter = %container.snapshotter,
            "committing container"
        );

        let (lease_id, lease) = self.create_lease().await.map_err(commit_err)?;
        let view_key = format!("imagebuilder-view-{}", uuid::Uuid::new_v4());

        let result = self
            .commit_leased(&container, reference, &lease, &view_key)
            .await;

        self.remove_view(&container.snapshotter, &view_key).await;
        self.delete_lease(&lease_id).await;

        result.map_err(commit_err)
    }

    async fn image_target(&self, name: &str) -> Result<Option<OciDescriptor>, EngineError> {
        let response = ImagesClient::new(self.channel.clone())
            .get(self.request(
                GetImageRequest {
                    name: name.to_string(),
                },
                None,
            ))
            .await;
        match response {
            Ok(r) => Ok(r
                .into_inner()
                .image
                .and_then(|i| i.target)
                .map(from_containerd)),
            Err(s) if s.code() == Code::NotFound => Ok(None),
            Err(s) => Err(store_err(name, "get image", s)),
        }
    }

    async fn has_blob(&self, digest: &str) -> Result<bool, EngineError> {
        match self.labels_of(digest).await {
            Ok(_) => Ok(true),
            Err(s) if s.code() == Code::NotFound => Ok(false),
            Err(s) => Err(store_err(digest, "content info", s)),
        }
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>, EngineError> {
        self.read(digest)
            .await
            .map_err(|s| store_err(digest, "read content", s))
    }

    async fn write_blob(
        &self,
        data: Vec<u8>,
        media_type: &str,
        references: &[String],
    ) -> Result<OciDescriptor, EngineError> {
        let labels = references
            .iter()
            .enumerate()
            .map(|(i, digest)| (format!("{}.m.{}", GC_REF_CONTENT_PREFIX, i), digest.clone()))
            .collect();

        let digest = sha256_digest(&data);

        // The lease is left to expire: it only has to protect the blob until
        // an image record references it.
        let (_, lease) = self
            .create_lease()
            .await
            .map_err(|reason| EngineError::PushFailed {
                reference: digest.clone(),
                reason,
            })?;

        self.write(data, media_type, labels, Some(&lease))
            .await
            .map_err(|s| store_err(&digest, "write content", s))
    }

    async fn put_image(&self, name: &str, target: &OciDescriptor) -> Result<(), EngineError> {
        let image = Image {
            name: name.to_string(),
            target: Some(to_containerd(target)),
            ..Default::default()
        };

        let mut images = ImagesClient::new(self.channel.clone());
        let created = images
            .create(self.request(
                CreateImageRequest {
                    image: Some(image.clone()),
                    ..Default::default()
                },
                None,
            ))
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(s) if s.code() == Code::AlreadyExists => images
                .update(self.request(
                    UpdateImageRequest {
                        image: Some(image),
                        ..Default::default()
                    },
                    None,
                ))
                .await
                .map(|_| ())
                .map_err(|s| store_err(name, "update image", s)),
            Err(s) => Err(store_err(name, "create image", s)),
        }
    }

    async fn delete_image(&self, name: &str) -> Result<(), EngineError> {
        let result = ImagesClient::new(self.channel.clone())
            .delete(self.request(
                DeleteImageRequest {
                    name: name.to_string(),
                    sync: false,
                    ..Default::default()
                },
                None,
            ))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(s) if s.code() == Code::NotFound => Ok(()),
            Err(s) => Err(store_err(name, "delete image", s)),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn status_reason(operation: &str, status: Status) -> String {
    format!("{}: {}", operation, status.message())
}

fn store_err(subject: &str, operation: &str, status: Status) -> EngineError {
    EngineError::PushFailed {
        reference: subject.to_string(),
        reason: status_reason(operation, status),
    }
}

fn from_containerd(d: Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: d.media_type,
        digest: d.digest,
        size: d.size,
        urls: None,
        annotations: None,
    }
}

fn to_containerd(d: &OciDescriptor) -> Descriptor {
    Descriptor {
        media_type: d.media_type.clone(),
        digest: d.digest.clone(),
        size: d.size,
        ..Default::default()
    }
}

/// Records a new layer in an image config: `rootfs.diff_ids`, `history`,
/// and `created`.
fn append_layer_to_config(config: &mut Value, diff_id: &str, reference: &str) {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    if !config["rootfs"].is_object() {
        config["rootfs"] = json!({ "type": "layers", "diff_ids": [] });
    }
    match config["rootfs"]["diff_ids"].as_array_mut() {
        Some(ids) => ids.push(json!(diff_id)),
        None => config["rootfs"]["diff_ids"] = json!([diff_id]),
    }

    let entry = json!({
        "created": now,
        "created_by": format!("imagebuilder commit {}", reference),
        "comment": "snapshot of running container",
    });
    match config["history"].as_array_mut() {
        Some(history) => history.push(entry),
        None => config["history"] = json!([entry]),
    }

    config["created"] = json!(now);
}

/// Points a manifest at the new config and appends the layer. Returns the
/// gc labels keeping config and layers alive.
fn append_layer_to_manifest(
    manifest: &mut Value,
    config: &OciDescriptor,
    layer: &Descriptor,
) -> Result<HashMap<String, String>, String> {
    manifest["config"]["digest"] = json!(config.digest);
    manifest["config"]["size"] = json!(config.size);

    let layers = manifest["layers"]
        .as_array_mut()
        .ok_or("base manifest has no layers")?;
    layers.push(json!({
        "mediaType": layer.media_type,
        "digest": layer.digest,
        "size": layer.size,
    }));

    let mut labels = HashMap::from([(
        format!("{}.config", GC_REF_CONTENT_PREFIX),
        config.digest.clone(),
    )]);
    for (i, l) in layers.iter().enumerate() {
        if let Some(digest) = l["digest"].as_str() {
            labels.insert(format!("{}.l.{}", GC_REF_CONTENT_PREFIX, i), digest.to_string());
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_layer_to_config() {
        let mut config = json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": ["sha256:base"] },
            "history": [{ "created_by": "base" }],
        });
        append_layer_to_config(&mut config, "sha256:new", "registry.local/img:v1");

        assert_eq!(config["rootfs"]["diff_ids"], json!(["sha256:base", "sha256:new"]));
        assert_eq!(config["history"].as_array().unwrap().len(), 2);
        assert!(config["created"].is_string());
        assert_eq!(config["architecture"], "amd64");
    }

    #[test]
    fn test_append_layer_to_config_without_rootfs() {
        let mut config = json!({});
        append_layer_to_config(&mut config, "sha256:new", "registry.local/img:v1");
        assert_eq!(config["rootfs"]["diff_ids"], json!(["sha256:new"]));
    }

    #[test]
    fn test_append_layer_to_manifest() {
        let mut manifest = json!({
            "schemaVersion": 2,
            "config": { "mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:oldcfg", "size": 10 },
            "layers": [{ "mediaType": OCI_LAYER_GZIP_MEDIA_TYPE, "digest": "sha256:base", "size": 100 }],
        });
        let config = OciDescriptor {
            media_type: "application/vnd.oci.image.config.v1+json".into(),
            digest: "sha256:newcfg".into(),
            size: 12,
            urls: None,
            annotations: None,
        };
        let layer = Descriptor {
            media_type: OCI_LAYER_GZIP_MEDIA_TYPE.into(),
            digest: "sha256:new".into(),
            size: 42,
            ..Default::default()
        };

        let labels = append_layer_to_manifest(&mut manifest, &config, &layer).unwrap();

        assert_eq!(manifest["config"]["digest"], "sha256:newcfg");
        assert_eq!(manifest["layers"].as_array().unwrap().len(), 2);
        assert_eq!(
            labels.get("containerd.io/gc.ref.content.config").map(String::as_str),
            Some("sha256:newcfg")
        );
        assert_eq!(
            labels.get("containerd.io/gc.ref.content.l.1").map(String::as_str),
            Some("sha256:new")
        );
    }
}
