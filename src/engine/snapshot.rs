//! Snapshot/converter engine.
//!
//! Commit is delegated to a [`ContentStore`] (containerd in production).
//! Push is driven client-side: manifests and blobs are read from the store
//! and uploaded through a [`RegistryTransport`].
//!
//! # Reduced-platform push
//!
//! Registries reject a multi-platform index whose child manifests reference
//! blobs that never arrive. Before pushing an index the engine checks which
//! entries have all their content locally:
//!
//! ```text
//! declared = platforms listed in the index
//! available = entries whose manifest, config, and layers exist locally
//!
//! available == declared  → push the index as-is
//! available ⊂ declared   → write a trimmed index, tag it
//!                          "<reference>-tmp-reduced-platform", push it,
//!                          delete the temporary tag afterwards
//! available == ∅         → PushFailed
//! ```
//!
//! The temporary image record is removed on every exit path, including
//! cancellation (the guard's `Drop` spawns the delete).
//!
//! # Upload tracking
//!
//! One [`PushTracker`] lives as long as the engine. Blobs already uploaded
//! to the destination repository are skipped, blobs known in a sibling
//! repository of the same registry are mounted. When the registry answers
//! with manifest-blob-unknown, the destination repository's tracker state
//! is dropped and the push is retried once.

use crate::constants::{
    is_index_media_type, is_non_distributable, REDUCED_PLATFORM_SUFFIX, RUNTIME_KIND_CONTAINERD,
};
use crate::engine::ImageEngine;
use crate::error::EngineError;
use crate::platform::{describe, PlatformSet, PlatformSpec};
use crate::registry::{
    digest_reference, parse_reference, repository_key, PushTracker, RegistryCredentials,
    RegistryTransport,
};
use crate::sign::Signer;
use async_trait::async_trait;
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageIndex, OciImageManifest};
use oci_distribution::Reference;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Content Store
// =============================================================================

/// Local content-addressed image store the snapshot engine works against.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Commits the container's filesystem as image record `reference`.
    async fn commit(&self, container_id: &str, reference: &str) -> Result<(), EngineError>;

    /// Target descriptor of image record `name`, if it exists.
    async fn image_target(&self, name: &str) -> Result<Option<OciDescriptor>, EngineError>;

    /// Returns true if the blob exists locally.
    async fn has_blob(&self, digest: &str) -> Result<bool, EngineError>;

    /// Reads a whole blob.
    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>, EngineError>;

    /// Writes a blob. `references` are the digests it points to, recorded
    /// so the store keeps them alive.
    async fn write_blob(
        &self,
        data: Vec<u8>,
        media_type: &str,
        references: &[String],
    ) -> Result<OciDescriptor, EngineError>;

    /// Creates or replaces image record `name`.
    async fn put_image(&self, name: &str, target: &OciDescriptor) -> Result<(), EngineError>;

    /// Deletes image record `name`. Missing records are not an error.
    async fn delete_image(&self, name: &str) -> Result<(), EngineError>;
}

// =============================================================================
// Engine
// =============================================================================

/// Content-store backed engine.
pub struct SnapshotEngine {
    store: Arc<dyn ContentStore>,
    transport: Arc<dyn RegistryTransport>,
    tracker: Arc<PushTracker>,
    signer: Option<Arc<dyn Signer>>,
}

impl SnapshotEngine {
    /// Creates an engine with a fresh push tracker and no signer.
    pub fn new(store: Arc<dyn ContentStore>, transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            store,
            transport,
            tracker: Arc::new(PushTracker::new()),
            signer: None,
        }
    }

    /// Shares an existing tracker.
    pub fn with_tracker(mut self, tracker: Arc<PushTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Signs every pushed image.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// The engine's upload tracker.
    pub fn tracker(&self) -> &Arc<PushTracker> {
        &self.tracker
    }

    /// Decides whether the image can be pushed as-is or must be reduced.
    async fn plan(&self, reference: &str, image: OciDescriptor) -> Result<PushPlan, EngineError> {
        if !is_index_media_type(&image.media_type) {
            return Ok(PushPlan::AsIs(image));
        }

        let index: OciImageIndex = self.read_json(reference, &image.digest).await?;

        let mut declared = PlatformSet::new();
        let mut available = PlatformSet::new();
        let mut present = HashSet::new();
        for entry in &index.manifests {
            let platform = entry_platform(entry);
            declared.insert(platform.clone());
            if self.is_complete(reference, entry).await? {
                available.insert(platform);
                present.insert(entry.digest.clone());
            }
        }

        debug!(
            reference,
            declared = %describe(&declared),
            available = %describe(&available),
            "resolved image platforms"
        );

        if present.is_empty() {
            return Err(EngineError::PushFailed {
                reference: reference.to_string(),
                reason: format!(
                    "no platform content available locally (declared: {})",
                    describe(&declared)
                ),
            });
        }

        if present.len() == index.manifests.len() {
            return Ok(PushPlan::AsIs(image));
        }

        info!(
            reference,
            available = %describe(&available),
            "image content is incomplete, pushing reduced-platform image"
        );
        let mut reduced = index;
        reduced.manifests.retain(|m| present.contains(&m.digest));
        Ok(PushPlan::Reduce {
            index: reduced,
            media_type: image.media_type,
        })
    }

    /// Returns true if the entry's manifest, config, and distributable
    /// layers all exist locally.
    async fn is_complete(
        &self,
        reference: &str,
        entry: &ImageIndexEntry,
    ) -> Result<bool, EngineError> {
        if !self.store.has_blob(&entry.digest).await? {
            return Ok(false);
        }
        let manifest: OciImageManifest = self.read_json(reference, &entry.digest).await?;
        if !self.store.has_blob(&manifest.config.digest).await? {
            return Ok(false);
        }
        for layer in &manifest.layers {
            if is_non_distributable(&layer.media_type) {
                continue;
            }
            if !self.store.has_blob(&layer.digest).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Materializes the reduced index under its temporary name.
    async fn reduce(
        &self,
        reference: &str,
        index: &OciImageIndex,
        media_type: &str,
    ) -> Result<(OciDescriptor, TempImage), EngineError> {
        let body = serde_json::to_vec(index).map_err(|e| EngineError::PushFailed {
            reference: reference.to_string(),
            reason: format!("encode reduced index: {}", e),
        })?;
        let children: Vec<String> = index.manifests.iter().map(|m| m.digest.clone()).collect();
        let target = self.store.write_blob(body, media_type, &children).await?;

        let name = format!("{}{}", reference, REDUCED_PLATFORM_SUFFIX);
        self.store.put_image(&name, &target).await?;
        debug!(reference, temp = %name, digest = %target.digest, "created reduced-platform image");

        Ok((target, TempImage::new(self.store.clone(), name)))
    }

    /// Pushes `root`, retrying once after the registry contradicted the
    /// tracker. Returns the pushed root digest.
    async fn push_with_retry(
        &self,
        target: &Reference,
        root: &OciDescriptor,
        credentials: &RegistryCredentials,
    ) -> Result<String, EngineError> {
        match self.push_root(target, root, credentials).await {
            Err(EngineError::ManifestConflict { reason, .. }) => {
                warn!(
                    reference = %target,
                    reason,
                    "registry reported missing blobs, refreshing tracker and retrying"
                );
                self.tracker.forget_repository(&repository_key(target));
                self.push_root(target, root, credentials).await
            }
            other => other,
        }
    }

    async fn push_root(
        &self,
        target: &Reference,
        root: &OciDescriptor,
        credentials: &RegistryCredentials,
    ) -> Result<String, EngineError> {
        self.transport.authenticate(target, credentials).await?;

        if is_index_media_type(&root.media_type) {
            let body = self.store.read_blob(&root.digest).await?;
            let index: OciImageIndex = parse_json(&target.whole(), &body)?;
            for entry in &index.manifests {
                let child = OciDescriptor {
                    media_type: entry.media_type.clone(),
                    digest: entry.digest.clone(),
                    size: entry.size,
                    urls: None,
                    annotations: None,
                };
                let child_ref = digest_reference(target, &entry.digest);
                self.push_manifest(target, &child_ref, &child).await?;
            }
            self.transport
                .push_manifest(target, body, &root.media_type)
                .await?;
        } else {
            self.push_manifest(target, target, root).await?;
        }

        Ok(root.digest.clone())
    }

    /// Uploads a single-platform manifest's blobs, then the manifest itself
    /// under `manifest_ref`.
    async fn push_manifest(
        &self,
        target: &Reference,
        manifest_ref: &Reference,
        descriptor: &OciDescriptor,
    ) -> Result<(), EngineError> {
        let body = self.store.read_blob(&descriptor.digest).await?;
        let manifest: OciImageManifest = parse_json(&target.whole(), &body)?;

        self.upload_blob(target, &manifest.config.digest).await?;
        for layer in &manifest.layers {
            if is_non_distributable(&layer.media_type) {
                debug!(digest = %layer.digest, "skipping non-distributable layer");
                continue;
            }
            self.upload_blob(target, &layer.digest).await?;
        }

        self.transport
            .push_manifest(manifest_ref, body, &descriptor.media_type)
            .await
    }

    async fn upload_blob(&self, target: &Reference, digest: &str) -> Result<(), EngineError> {
        let repository = repository_key(target);
        if self.tracker.is_uploaded(&repository, digest) {
            debug!(digest, repository, "blob already uploaded");
            return Ok(());
        }

        if let Some(source_repo) =
            self.tracker
                .find_mount_source(target.registry(), digest, &repository)
        {
            let source = Reference::with_digest(
                target.registry().to_string(),
                source_repo.clone(),
                digest.to_string(),
            );
            match self.transport.mount_blob(target, &source, digest).await {
                Ok(()) => {
                    debug!(digest, from = %source_repo, "mounted blob");
                    self.tracker.mark_uploaded(&repository, digest);
                    return Ok(());
                }
                Err(e) => debug!(digest, error = %e, "blob mount failed, uploading"),
            }
        }

        let data = self.store.read_blob(digest).await?;
        self.transport.push_blob(target, &data, digest).await?;
        self.tracker.mark_uploaded(&repository, digest);
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        reference: &str,
        digest: &str,
    ) -> Result<T, EngineError> {
        let body = self.store.read_blob(digest).await?;
        parse_json(reference, &body)
    }
}

#[async_trait]
impl ImageEngine for SnapshotEngine {
    fn name(&self) -> &str {
        RUNTIME_KIND_CONTAINERD
    }

    async fn commit(&self, container_id: &str, reference: &str) -> Result<(), EngineError> {
        parse_reference(reference)?;
        self.store.commit(container_id, reference).await
    }

    async fn push(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError> {
        let target = parse_reference(reference)?;
        let image =
            self.store
                .image_target(reference)
                .await?
                .ok_or_else(|| EngineError::PushFailed {
                    reference: reference.to_string(),
                    reason: "image not found in local store".to_string(),
                })?;

        let (root, temp) = match self.plan(reference, image).await? {
            PushPlan::AsIs(root) => (root, None),
            PushPlan::Reduce { index, media_type } => {
                let (root, temp) = self.reduce(reference, &index, &media_type).await?;
                (root, Some(temp))
            }
        };

        info!(reference, digest = %root.digest, "pushing image");
        let result = self.push_with_retry(&target, &root, credentials).await;

        if let Some(temp) = temp {
            temp.remove().await;
        }

        let digest = result?;
        info!(reference, digest, "pushed image");

        if let Some(signer) = &self.signer {
            let signed = format!("{}@{}", repository_key(&target), digest);
            // The image already exists remotely; a failed signature is
            // reported but does not fail the push.
            if let Err(e) = signer.sign(&signed, credentials).await {
                warn!(reference = %signed, error = %e, "image signing failed");
            }
        }

        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

enum PushPlan {
    AsIs(OciDescriptor),
    Reduce {
        index: OciImageIndex,
        media_type: String,
    },
}

/// Temporary image record removed on every exit path.
struct TempImage {
    store: Arc<dyn ContentStore>,
    name: String,
    removed: bool,
}

impl TempImage {
    fn new(store: Arc<dyn ContentStore>, name: String) -> Self {
        Self {
            store,
            name,
            removed: false,
        }
    }

    async fn remove(mut self) {
        self.removed = true;
        match self.store.delete_image(&self.name).await {
            Ok(()) => debug!(name = %self.name, "removed temporary image"),
            Err(e) => warn!(name = %self.name, error = %e, "failed to remove temporary image"),
        }
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let store = self.store.clone();
        let name = std::mem::take(&mut self.name);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.delete_image(&name).await {
                    warn!(name, error = %e, "failed to remove temporary image");
                }
            });
        } else {
            warn!(name, "no runtime to remove temporary image");
        }
    }
}

fn entry_platform(entry: &ImageIndexEntry) -> PlatformSpec {
    entry
        .platform
        .as_ref()
        .map(PlatformSpec::from_oci)
        .unwrap_or_else(|| PlatformSpec::new("unknown", "unknown"))
}

fn parse_json<T: serde::de::DeserializeOwned>(
    reference: &str,
    body: &[u8],
) -> Result<T, EngineError> {
    serde_json::from_slice(body).map_err(|e| EngineError::PushFailed {
        reference: reference.to_string(),
        reason: format!("malformed manifest: {}", e),
    })
}

