//! Image signing.
//!
//! After a successful push the snapshot engine signs `repository@digest`.
//! [`CosignSigner`] shells out to the `cosign` CLI with a key file; the
//! signature is stored next to the image in the same registry.
//!
//! Registry credentials never appear on the command line. They are written
//! to a private docker config that cosign reads through `DOCKER_CONFIG`.

use crate::constants::SIGN_TIMEOUT;
use crate::error::EngineError;
use crate::registry::{parse_reference, RegistryCredentials};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Docker config key cosign looks up for Docker Hub.
const DOCKER_HUB_CONFIG_KEY: &str = "https://index.docker.io/v1/";

/// Produces a signature for a pushed image.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Signs `reference`, which always carries a digest.
    async fn sign(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError>;
}

/// Signs with `cosign sign --key <key>`.
#[derive(Debug, Clone)]
pub struct CosignSigner {
    binary: PathBuf,
    key: PathBuf,
}

impl CosignSigner {
    pub fn new(binary: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            key: key.into(),
        }
    }

    fn args(&self, reference: &str) -> Vec<String> {
        vec![
            "sign".to_string(),
            "--yes".to_string(),
            "--tlog-upload=false".to_string(),
            "--key".to_string(),
            self.key.display().to_string(),
            reference.to_string(),
        ]
    }
}

fn docker_config_key(registry: &str) -> &str {
    match registry {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB_CONFIG_KEY,
        other => other,
    }
}

/// Renders a docker `config.json` granting `credentials` on `registry`.
pub fn docker_config(registry: &str, credentials: &RegistryCredentials) -> serde_json::Value {
    let auth = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
    let mut auths = serde_json::Map::new();
    auths.insert(
        docker_config_key(registry).to_string(),
        json!({ "auth": auth }),
    );
    json!({ "auths": auths })
}

async fn write_docker_config(
    dir: &Path,
    registry: &str,
    credentials: &RegistryCredentials,
) -> std::io::Result<()> {
    let config = docker_config(registry, credentials);
    tokio::fs::write(dir.join("config.json"), config.to_string()).await
}

#[async_trait]
impl Signer for CosignSigner {
    async fn sign(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError> {
        let sign_err = |reason: String| EngineError::SignFailed {
            reference: reference.to_string(),
            reason,
        };

        debug!(reference, key = %self.key.display(), "signing image");
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(self.args(reference)).kill_on_drop(true);

        // Removed when dropped, after cosign has exited.
        let _config_dir = if credentials.is_anonymous() {
            None
        } else {
            let registry = parse_reference(reference)?.registry().to_string();
            let dir = tempfile::tempdir()
                .map_err(|e| sign_err(format!("create docker config dir: {}", e)))?;
            write_docker_config(dir.path(), &registry, credentials)
                .await
                .map_err(|e| sign_err(format!("write docker config: {}", e)))?;
            cmd.env("DOCKER_CONFIG", dir.path());
            Some(dir)
        };

        let output = tokio::time::timeout(SIGN_TIMEOUT, cmd.output())
            .await
            .map_err(|_| sign_err(format!("timed out after {:?}", SIGN_TIMEOUT)))?
            .map_err(|e| sign_err(format!("run {}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(sign_err(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            )));
        }

        info!(reference, "signed image");
        Ok(())
    }
}
