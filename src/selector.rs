//! Runtime selector.
//!
//! The single place that maps a node's advertised runtime identifier
//! (`<kind>://<version>`, from `status.nodeInfo.containerRuntimeVersion`) to
//! an [`Engine`]. Unknown kinds fail closed with
//! [`Error::UnsupportedRuntime`]; a node's runtime does not change while a
//! request is in flight, so the error is never retried.

use crate::config::EngineOptions;
use crate::constants::{RUNTIME_ID_SEPARATOR, RUNTIME_KIND_CONTAINERD, RUNTIME_KIND_DOCKER};
use crate::engine::containerd::ContainerdStore;
use crate::engine::{DaemonEngine, Engine, EngineKind, SnapshotEngine};
use crate::error::{Error, Result};
use crate::registry::OciTransport;
use crate::sign::CosignSigner;
use std::sync::Arc;
use tracing::info;

/// Container runtime kinds with a matching engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Containerd,
}

impl RuntimeKind {
    /// Parses the kind from a runtime identifier.
    ///
    /// Only the part before `://` is considered, matched case-sensitively.
    pub fn from_identifier(identifier: &str) -> Result<Self> {
        let kind = identifier
            .split_once(RUNTIME_ID_SEPARATOR)
            .map_or(identifier, |(kind, _)| kind);
        match kind {
            RUNTIME_KIND_DOCKER => Ok(Self::Docker),
            RUNTIME_KIND_CONTAINERD => Ok(Self::Containerd),
            other => Err(Error::UnsupportedRuntime(other.to_string())),
        }
    }

    /// Engine family serving this runtime.
    pub fn engine_kind(self) -> EngineKind {
        match self {
            Self::Docker => EngineKind::Daemon,
            Self::Containerd => EngineKind::Snapshot,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docker => RUNTIME_KIND_DOCKER,
            Self::Containerd => RUNTIME_KIND_CONTAINERD,
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects and connects the engine for a node's runtime identifier.
pub async fn select(identifier: &str, options: &EngineOptions) -> Result<Engine> {
    let kind = RuntimeKind::from_identifier(identifier)?;
    info!(identifier, kind = %kind, engine = %kind.engine_kind(), "selected engine");
    connect(kind, options).await
}

/// Connects the engine for `kind` on its well-known socket.
pub async fn connect(kind: RuntimeKind, options: &EngineOptions) -> Result<Engine> {
    match kind {
        RuntimeKind::Docker => {
            let engine = DaemonEngine::connect(&options.docker_socket).await?;
            Ok(Engine::Daemon(engine))
        }
        RuntimeKind::Containerd => {
            let store = ContainerdStore::connect(
                &options.containerd_socket,
                &options.containerd_namespace,
            )
            .await?;
            let transport = OciTransport::new(
                options.insecure_registry,
                options.plain_http_registries.clone(),
            );
            let mut engine = SnapshotEngine::new(Arc::new(store), Arc::new(transport));
            if let Some(key) = &options.signing_key {
                engine = engine.with_signer(Arc::new(CosignSigner::new(
                    options.cosign_binary.clone(),
                    key.clone(),
                )));
            }
            Ok(Engine::Snapshot(engine))
        }
    }
}
