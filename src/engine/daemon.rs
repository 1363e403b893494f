//! Daemon-socket engine (docker).
//!
//! Commit pauses the container only while the daemon snapshots it. Push and
//! save are delegated to the daemon; push progress is streamed back and
//! every message carrying an error is classified instead of ignored.

use crate::constants::{DOCKER_CONNECT_TIMEOUT_SECS, RUNTIME_KIND_DOCKER};
use crate::engine::ImageEngine;
use crate::error::EngineError;
use crate::registry::{classify_push_error, parse_reference, RegistryCredentials};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::Config;
use bollard::image::{CommitContainerOptions, PushImageOptions};
use bollard::Docker;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Docker daemon engine.
pub struct DaemonEngine {
    docker: Docker,
    socket: String,
}

impl DaemonEngine {
    /// Connects to the daemon socket and verifies it answers.
    pub async fn connect(socket: &str) -> Result<Self, EngineError> {
        let connect_err = |reason: String| EngineError::Connect {
            socket: socket.to_string(),
            reason,
        };

        let docker = Docker::connect_with_unix(
            socket,
            DOCKER_CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| connect_err(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        info!(socket, "connected to docker daemon");
        Ok(Self {
            docker,
            socket: socket.to_string(),
        })
    }

    /// Returns the socket this engine talks to.
    pub fn socket(&self) -> &str {
        &self.socket
    }
}

#[async_trait]
impl ImageEngine for DaemonEngine {
    fn name(&self) -> &str {
        RUNTIME_KIND_DOCKER
    }

    async fn commit(&self, container_id: &str, reference: &str) -> Result<(), EngineError> {
        let (repo, tag) = repo_and_tag(reference)?;
        debug!(container_id, repo, tag, "committing container");

        match self
            .docker
            .commit_container(
                commit_options(container_id, repo, tag),
                Config::<String>::default(),
            )
            .await
        {
            Ok(commit) => {
                info!(container_id, reference, image = ?commit.id, "committed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(EngineError::ContainerNotFound(container_id.to_string())),
            Err(e) => Err(EngineError::CommitFailed {
                container: container_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn push(
        &self,
        reference: &str,
        credentials: &RegistryCredentials,
    ) -> Result<(), EngineError> {
        let (repo, tag) = repo_and_tag(reference)?;
        let parsed = parse_reference(reference)?;
        let auth = docker_credentials(credentials, parsed.registry());

        info!(reference, anonymous = credentials.is_anonymous(), "pushing image");
        let mut stream = self
            .docker
            .push_image(&repo, Some(PushImageOptions { tag }), auth);

        while let Some(message) = stream.next().await {
            match message {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(classify_push_error(reference, &error));
                    }
                    if let Some(status) = info.status {
                        debug!(reference, status, "push progress");
                    }
                }
                Err(e) => return Err(classify_push_error(reference, &e.to_string())),
            }
        }

        info!(reference, "pushed image");
        Ok(())
    }

    async fn save(&self, reference: &str, output: &Path) -> Result<(), EngineError> {
        let save_err = |reason: String| EngineError::SaveFailed {
            reference: reference.to_string(),
            reason,
        };

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| save_err(format!("create {}: {}", parent.display(), e)))?;
        }

        // Written next to the target and renamed so readers never see a
        // truncated archive.
        let partial = partial_path(output);
        let written = async {
            let mut file = tokio::fs::File::create(&partial)
                .await
                .map_err(|e| save_err(format!("create {}: {}", partial.display(), e)))?;

            let mut stream = self.docker.export_image(reference);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| save_err(e.to_string()))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| save_err(format!("write {}: {}", partial.display(), e)))?;
            }
            file.sync_all()
                .await
                .map_err(|e| save_err(format!("sync {}: {}", partial.display(), e)))?;

            tokio::fs::rename(&partial, output)
                .await
                .map_err(|e| save_err(format!("rename to {}: {}", output.display(), e)))
        }
        .await;

        if written.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        } else {
            info!(reference, path = %output.display(), "saved image archive");
        }
        written
    }
}

/// Splits a reference into the daemon's `repo` and `tag` arguments.
fn repo_and_tag(reference: &str) -> Result<(String, String), EngineError> {
    let parsed = parse_reference(reference)?;
    let tag = match (parsed.tag(), parsed.digest()) {
        (Some(tag), _) => tag.to_string(),
        (None, Some(_)) => {
            return Err(EngineError::InvalidReference {
                reference: reference.to_string(),
                reason: "a tag is required to commit and push through the daemon".to_string(),
            })
        }
        (None, None) => "latest".to_string(),
    };
    Ok((format!("{}/{}", parsed.registry(), parsed.repository()), tag))
}

fn docker_credentials(
    credentials: &RegistryCredentials,
    registry: &str,
) -> Option<DockerCredentials> {
    if credentials.is_anonymous() {
        return None;
    }
    Some(DockerCredentials {
        username: Some(credentials.username.clone()),
        password: Some(credentials.password.clone()),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    })
}

/// Commit options; the container stays paused only while the daemon snapshots it.
fn commit_options(
    container_id: &str,
    repo: String,
    tag: String,
) -> CommitContainerOptions<String> {
    CommitContainerOptions {
        container: container_id.to_string(),
        repo,
        tag,
        pause: true,
        ..Default::default()
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    output.with_file_name(name)
}
