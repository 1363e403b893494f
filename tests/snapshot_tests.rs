//! Tests for the snapshot engine's push path.
//!
//! Runs against an in-memory content store and a transport that records
//! every upload, so platform reduction, temp-image cleanup, tracker reuse,
//! and the conflict retry can be observed directly.

mod common;

use async_trait::async_trait;
use common::*;
use imagebuilder::constants::REDUCED_PLATFORM_SUFFIX;
use imagebuilder::engine::snapshot::ContentStore;
use imagebuilder::sign::Signer;
use imagebuilder::{EngineError, ImageEngine, RegistryCredentials, SnapshotEngine};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

fn engine(store: &Arc<MemoryStore>, transport: &Arc<RecordingTransport>) -> SnapshotEngine {
    SnapshotEngine::new(store.clone(), transport.clone())
}

fn temp_name() -> String {
    format!("{}{}", REFERENCE, REDUCED_PLATFORM_SUFFIX)
}

/// Index over a complete amd64 image and an arm64 image whose layer was
/// never pulled.
fn partial_index(store: &MemoryStore) -> String {
    let (amd64, _) = store.add_image("amd64");
    let config = store.add_blob(b"config-arm64", OCI_CONFIG);
    let layer = store.missing_blob(b"layer-arm64", OCI_LAYER);
    let arm64 = store.add_manifest(&config, &[layer]);
    let index = store.add_index(&[(amd64.clone(), "linux/amd64"), (arm64, "linux/arm64")]);
    store.tag(REFERENCE, &index);
    amd64.digest
}

// =============================================================================
// Commit
// =============================================================================

#[tokio::test]
async fn test_commit_delegates_to_store() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());

    engine(&store, &transport)
        .commit("4f2a", REFERENCE)
        .await
        .unwrap();

    assert_eq!(
        *store.commits.lock().unwrap(),
        vec![("4f2a".to_string(), REFERENCE.to_string())]
    );
}

#[tokio::test]
async fn test_commit_rejects_invalid_reference() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());

    let err = engine(&store, &transport)
        .commit("4f2a", "registry.local/img:v1 ; rm -rf")
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidReference { .. }));
    assert!(store.commits.lock().unwrap().is_empty());
}

// =============================================================================
// Single-platform Push
// =============================================================================

#[tokio::test]
async fn test_push_single_platform_image() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let (manifest, blobs) = store.add_image("a");
    store.tag(REFERENCE, &manifest);

    engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap();

    assert_eq!(transport.blob_digests(), blobs);
    assert_eq!(transport.manifest_refs(), vec![REFERENCE.to_string()]);
    assert!(store.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_push_of_unknown_image_fails() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());

    let err = engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::PushFailed { .. }));
}

#[tokio::test]
async fn test_non_distributable_layers_are_not_uploaded() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let config = store.add_blob(b"config-win", OCI_CONFIG);
    let foreign = store.missing_blob(b"windows-base", FOREIGN_LAYER);
    let layer = store.add_blob(b"layer-win", OCI_LAYER);
    let manifest = store.add_manifest(&config, &[foreign.clone(), layer.clone()]);
    let index = store.add_index(&[(manifest, "windows/amd64")]);
    store.tag(REFERENCE, &index);

    engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap();

    let uploaded = transport.unique_blobs();
    assert!(uploaded.contains(&layer.digest));
    assert!(!uploaded.contains(&foreign.digest));
    // Complete apart from the foreign layer: pushed as-is.
    assert!(store.created.lock().unwrap().is_empty());
}

// =============================================================================
// Reduced-platform Push
// =============================================================================

#[tokio::test]
async fn test_partial_index_is_reduced_once_and_cleaned_up() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let amd64 = partial_index(&store);

    engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap();

    assert_eq!(*store.created.lock().unwrap(), vec![temp_name()]);
    assert_eq!(*store.deleted.lock().unwrap(), vec![temp_name()]);
    assert!(!store.has_image(&temp_name()));
    assert!(store.has_image(REFERENCE));

    let manifests = transport.manifests.lock().unwrap().clone();
    assert_eq!(manifests.len(), 2);
    assert_eq!(manifests[0].0, format!("registry.local/img@{}", amd64));
    assert_eq!(manifests[1].0, REFERENCE);
    assert_eq!(manifests[1].1, OCI_INDEX);

    let pushed: serde_json::Value = serde_json::from_slice(&manifests[1].2).unwrap();
    let entries = pushed["manifests"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["digest"], amd64);
    assert_eq!(entries[0]["platform"]["architecture"], "amd64");
}

#[tokio::test]
async fn test_complete_index_is_pushed_as_is() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let (amd64, _) = store.add_image("amd64");
    let (arm64, _) = store.add_image("arm64");
    let index = store.add_index(&[(amd64, "linux/amd64"), (arm64, "linux/arm64")]);
    store.tag(REFERENCE, &index);

    engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap();

    assert!(store.created.lock().unwrap().is_empty());
    let manifests = transport.manifests.lock().unwrap().clone();
    assert_eq!(manifests.len(), 3);
    assert_eq!(manifests[2].2, store.blob(&index.digest).unwrap());
}

#[tokio::test]
async fn test_index_without_local_content_fails() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let missing = store.missing_blob(b"never-pulled", OCI_MANIFEST);
    let index = store.add_index(&[(missing, "linux/amd64")]);
    store.tag(REFERENCE, &index);

    let err = engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap_err();

    assert!(
        matches!(&err, EngineError::PushFailed { reason, .. } if reason.contains("linux/amd64")),
        "{}",
        err
    );
    assert!(store.created.lock().unwrap().is_empty());
    assert!(transport.manifests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_temp_image_removed_when_push_fails() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport {
        deny: true,
        ..Default::default()
    });
    partial_index(&store);

    let err = engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::new("bob", "wrong"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::AuthFailed { .. }));
    assert_eq!(*store.deleted.lock().unwrap(), vec![temp_name()]);
    assert!(!store.has_image(&temp_name()));
}

// =============================================================================
// Upload Tracking
// =============================================================================

#[tokio::test]
async fn test_manifest_conflict_retries_once_with_fresh_tracker() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    transport.conflicts.store(1, Ordering::SeqCst);
    let (manifest, blobs) = store.add_image("a");
    store.tag(REFERENCE, &manifest);

    engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap();

    // Both attempts upload every blob: the retry does not trust the tracker.
    assert_eq!(transport.blob_digests().len(), blobs.len() * 2);
    assert_eq!(transport.manifest_refs(), vec![REFERENCE.to_string()]);
}

#[tokio::test]
async fn test_repeated_conflict_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    transport.conflicts.store(2, Ordering::SeqCst);
    let (manifest, _) = store.add_image("a");
    store.tag(REFERENCE, &manifest);

    let err = engine(&store, &transport)
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ManifestConflict { .. }));
}

#[tokio::test]
async fn test_uploaded_blobs_are_skipped_on_repush() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let (manifest, blobs) = store.add_image("a");
    store.tag(REFERENCE, &manifest);
    let engine = engine(&store, &transport);

    for _ in 0..2 {
        engine
            .push(REFERENCE, &RegistryCredentials::anonymous())
            .await
            .unwrap();
    }

    assert_eq!(transport.blob_digests(), blobs);
    assert_eq!(transport.manifest_refs().len(), 2);
}

#[tokio::test]
async fn test_blobs_known_in_sibling_repository_are_mounted() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let (manifest, blobs) = store.add_image("a");
    store.tag(REFERENCE, &manifest);
    store.tag("registry.local/other:v1", &manifest);
    let engine = engine(&store, &transport);

    engine
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap();
    engine
        .push("registry.local/other:v1", &RegistryCredentials::anonymous())
        .await
        .unwrap();

    assert_eq!(transport.blob_digests(), blobs);
    let mounts = transport.mounts.lock().unwrap().clone();
    assert_eq!(mounts.len(), blobs.len());
    assert!(mounts.iter().all(|(repo, _)| repo == "registry.local/other"));
    assert!(engine
        .tracker()
        .is_uploaded("registry.local/other", &blobs[0]));
}

#[tokio::test]
async fn test_failed_mount_falls_back_to_upload() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport {
        mount_fails: true,
        ..Default::default()
    });
    let (manifest, blobs) = store.add_image("a");
    store.tag(REFERENCE, &manifest);
    store.tag("registry.local/other:v1", &manifest);
    let engine = engine(&store, &transport);

    engine
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap();
    engine
        .push("registry.local/other:v1", &RegistryCredentials::anonymous())
        .await
        .unwrap();

    assert_eq!(transport.blob_digests().len(), blobs.len() * 2);
}

// =============================================================================
// Signing
// =============================================================================

#[derive(Default)]
struct RecordingSigner {
    signed: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl Signer for RecordingSigner {
    async fn sign(
        &self,
        reference: &str,
        _credentials: &RegistryCredentials,
    ) -> Result<(), EngineError> {
        self.signed.lock().unwrap().push(reference.to_string());
        if self.fail {
            return Err(EngineError::SignFailed {
                reference: reference.to_string(),
                reason: "no key".to_string(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_pushed_digest_is_signed() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let signer = Arc::new(RecordingSigner::default());
    let (manifest, _) = store.add_image("a");
    store.tag(REFERENCE, &manifest);

    engine(&store, &transport)
        .with_signer(signer.clone())
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await
        .unwrap();

    assert_eq!(
        *signer.signed.lock().unwrap(),
        vec![format!("registry.local/img@{}", manifest.digest)]
    );
}

#[tokio::test]
async fn test_sign_failure_does_not_fail_push() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let signer = Arc::new(RecordingSigner {
        fail: true,
        ..Default::default()
    });
    let (manifest, _) = store.add_image("a");
    store.tag(REFERENCE, &manifest);

    let result = engine(&store, &transport)
        .with_signer(signer.clone())
        .push(REFERENCE, &RegistryCredentials::anonymous())
        .await;

    assert!(result.is_ok());
    assert_eq!(signer.signed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_reports_missing_blob() {
    let store = MemoryStore::new();
    assert!(!store.has_blob("sha256:nothing").await.unwrap());
}
