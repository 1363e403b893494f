//! # OCI Registry Push Plumbing
//!
//! Reference validation, credentials, the shared upload tracker, and the
//! transport the snapshot engine pushes through.
//!
//! ## Reference Validation
//!
//! All destination references are validated before use:
//! - Length check against `MAX_IMAGE_REF_LEN` (512 bytes)
//! - Character allowlist validation (alphanumeric + `/:.-_@`)
//! - Proper format parsing via `oci-distribution`
//!
//! ## Upload Tracking
//!
//! Registries key blob existence by repository. [`PushTracker`] remembers
//! which blobs were uploaded to which repository for the lifetime of the
//! engine, so a later push to a different repository on the same registry
//! mounts shared layers instead of re-uploading them, and a retried push
//! does not re-send what the registry already accepted.
//!
//! ## Authentication
//!
//! | Credentials | Registry auth |
//! |-------------|---------------|
//! | empty username | anonymous |
//! | username + password | basic (base64 encoded by the client) |
//!
//! TLS verification is off by default (`insecure = true`). This mirrors how
//! in-cluster registries with self-signed certificates are usually run; set
//! it to `false` for registries with publicly trusted certificates.

use crate::constants::{IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN};
use crate::error::EngineError;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

// =============================================================================
// References
// =============================================================================

/// Parses and validates a destination reference.
///
/// ## Errors
///
/// [`EngineError::InvalidReference`] if the reference is empty, too long,
/// contains characters outside the allowlist, or does not parse.
pub fn parse_reference(image_ref: &str) -> Result<Reference, EngineError> {
    let invalid = |reason: String| EngineError::InvalidReference {
        reference: image_ref.to_string(),
        reason,
    };

    if image_ref.is_empty() {
        return Err(invalid("reference is empty".to_string()));
    }

    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(invalid(format!("exceeds {} bytes", MAX_IMAGE_REF_LEN)));
    }

    if !image_ref.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err(invalid("contains invalid characters".to_string()));
    }

    image_ref.parse().map_err(|e| invalid(format!("{}", e)))
}

/// `registry/repository`, the unit registries track blob existence by.
pub fn repository_key(reference: &Reference) -> String {
    format!("{}/{}", reference.registry(), reference.repository())
}

/// Same repository, addressed by digest.
pub fn digest_reference(reference: &Reference, digest: &str) -> Reference {
    Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
}

/// Content digest (`sha256:<hex>`) of a blob.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

// =============================================================================
// Credentials
// =============================================================================

/// Registry username/password pair from the request spec.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials for anonymous access.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Anonymous when no username is given.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }

    /// Converts to the `oci-distribution` auth type.
    pub fn to_registry_auth(&self) -> RegistryAuth {
        if self.is_anonymous() {
            RegistryAuth::Anonymous
        } else {
            RegistryAuth::Basic(self.username.clone(), self.password.clone())
        }
    }
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Error Classification
// =============================================================================

/// Classifies a registry-reported push failure by its message.
///
/// Shared by the daemon engine (which only sees progress-stream text) and
/// the OCI transport (for errors without a structured variant).
pub fn classify_push_error(reference: &str, message: &str) -> EngineError {
    let lower = message.to_ascii_lowercase();
    let reason = message.to_string();
    let reference = reference.to_string();

    if lower.contains("manifest blob unknown")
        || lower.contains("manifest_blob_unknown")
        || lower.contains("blob unknown to registry")
    {
        EngineError::ManifestConflict { reference, reason }
    } else if lower.contains("unauthorized")
        || lower.contains("denied")
        || lower.contains("authentication required")
    {
        EngineError::AuthFailed { reference, reason }
    } else {
        EngineError::PushFailed { reference, reason }
    }
}

fn map_oci_error(reference: &Reference, e: OciDistributionError) -> EngineError {
    match e {
        OciDistributionError::AuthenticationFailure(reason) => EngineError::AuthFailed {
            reference: reference.whole(),
            reason,
        },
        OciDistributionError::UnauthorizedError { url } => EngineError::AuthFailed {
            reference: reference.whole(),
            reason: format!("unauthorized: {}", url),
        },
        other => classify_push_error(&reference.whole(), &other.to_string()),
    }
}

// =============================================================================
// Push Tracker
// =============================================================================

/// Blobs known to exist per repository.
///
/// One tracker lives as long as its engine and is shared by every push it
/// performs.
#[derive(Debug, Default)]
pub struct PushTracker {
    uploaded: Mutex<HashMap<String, HashSet<String>>>,
}

impl PushTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `digest` exists in `repository`.
    pub fn mark_uploaded(&self, repository: &str, digest: &str) {
        if let Ok(mut uploaded) = self.uploaded.lock() {
            uploaded
                .entry(repository.to_string())
                .or_default()
                .insert(digest.to_string());
        }
    }

    /// Returns true if `digest` is known to exist in `repository`.
    pub fn is_uploaded(&self, repository: &str, digest: &str) -> bool {
        self.uploaded
            .lock()
            .map(|u| u.get(repository).is_some_and(|d| d.contains(digest)))
            .unwrap_or(false)
    }

    /// Finds another repository on `registry` already holding `digest`.
    ///
    /// Returns the repository path without the registry prefix.
    pub fn find_mount_source(
        &self,
        registry: &str,
        digest: &str,
        exclude: &str,
    ) -> Option<String> {
        let prefix = format!("{}/", registry);
        let uploaded = self.uploaded.lock().ok()?;
        let mut candidates: Vec<&String> = uploaded
            .iter()
            .filter(|(repo, digests)| {
                repo.as_str() != exclude && repo.starts_with(&prefix) && digests.contains(digest)
            })
            .map(|(repo, _)| repo)
            .collect();
        candidates.sort();
        candidates
            .first()
            .map(|repo| repo[prefix.len()..].to_string())
    }

    /// Drops everything known about `repository`.
    ///
    /// Used after the registry contradicted the tracker (manifest blob
    /// unknown) so the retry re-uploads instead of trusting stale state.
    pub fn forget_repository(&self, repository: &str) {
        if let Ok(mut uploaded) = self.uploaded.lock() {
            uploaded.remove(repository);
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Registry operations the snapshot engine needs.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Authenticates for push against the reference's registry.
    async fn authenticate(
        &self,
        reference: &Reference,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError>;

    /// Uploads one blob.
    async fn push_blob(
        &self,
        reference: &Reference,
        data: &[u8],
        digest: &str,
    ) -> Result<(), EngineError>;

    /// Mounts a blob from `source` (same registry) into `reference`.
    async fn mount_blob(
        &self,
        reference: &Reference,
        source: &Reference,
        digest: &str,
    ) -> Result<(), EngineError>;

    /// Uploads a manifest or index under the reference's tag or digest.
    async fn push_manifest(
        &self,
        reference: &Reference,
        body: Vec<u8>,
        media_type: &str,
    ) -> Result<(), EngineError>;
}

/// [`RegistryTransport`] over `oci-distribution`.
pub struct OciTransport {
    client: Client,
}

impl OciTransport {
    /// Creates a transport.
    ///
    /// `plain_http` lists registries (host[:port]) reached without TLS.
    pub fn new(insecure: bool, plain_http: Vec<String>) -> Self {
        let protocol = if plain_http.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(plain_http)
        };
        Self {
            client: Client::new(ClientConfig {
                protocol,
                accept_invalid_certificates: insecure,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl RegistryTransport for OciTransport {
    async fn authenticate(
        &self,
        reference: &Reference,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError> {
        debug!(
            registry = reference.registry(),
            anonymous = credentials.is_anonymous(),
            "authenticating"
        );
        self.client
            .auth(
                reference,
                &credentials.to_registry_auth(),
                RegistryOperation::Push,
            )
            .await
            .map(|_| ())
            .map_err(|e| map_oci_error(reference, e))
    }

    async fn push_blob(
        &self,
        reference: &Reference,
        data: &[u8],
        digest: &str,
    ) -> Result<(), EngineError> {
        self.client
            .push_blob(reference, data, digest)
            .await
            .map(|_| ())
            .map_err(|e| map_oci_error(reference, e))
    }

    async fn mount_blob(
        &self,
        reference: &Reference,
        source: &Reference,
        digest: &str,
    ) -> Result<(), EngineError> {
        self.client
            .mount_blob(reference, source, digest)
            .await
            .map_err(|e| map_oci_error(reference, e))
    }

    async fn push_manifest(
        &self,
        reference: &Reference,
        body: Vec<u8>,
        media_type: &str,
    ) -> Result<(), EngineError> {
        let content_type = media_type.parse().map_err(|e| EngineError::PushFailed {
            reference: reference.whole(),
            reason: format!("invalid media type {}: {}", media_type, e),
        })?;
        self.client
            .push_manifest_raw(reference, body, content_type)
            .await
            .map(|_| ())
            .map_err(|e| map_oci_error(reference, e))
    }
}
