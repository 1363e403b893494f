//! Request reconciler.
//!
//! One call advances one request by at most one state, re-reading the
//! request and its pod from the cluster every time:
//!
//! ```text
//! state        action                                         next
//! ─────────    ─────────────────────────────────────────────  ─────────
//! ""           podName empty                                  Failed
//!              pod missing / unscheduled                      (requeue)
//!              [direct] pod on another node                   (ignore)
//!              pod found                                      Creating(node)
//! Creating     pod gone                                       Failed
//!              container id missing                           Failed
//!              [direct] commit + push/save in-process         Succeeded | Failed
//!              [delegated] create job, start watcher          Running
//!              [delegated] job rejected by the API server     Failed
//! Running      [delegated] re-attach watcher if none runs     (watcher writes)
//! Succeeded    [delegated] delete job if it still exists      -
//! Failed       -                                              -
//! ```
//!
//! The surrounding dispatch layer guarantees a key is never reconciled
//! concurrently with itself; nothing here locks per key.

use crate::cluster::{container_id, pod_node_name, ClusterClient};
use crate::config::{EngineOptions, JobSettings};
use crate::constants::LOOKUP_REQUEUE_DELAY;
use crate::engine::ImageEngine;
use crate::error::{Error, Result};
use crate::job::{build_job, job_name};
use crate::pipeline::{execute, ImageRequest};
use crate::poller::JobWatchers;
use crate::resource::{BuildState, ImageBuilder, ImageBuilderStatus, ObjectKey};
use crate::status::StatusWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reason recorded when a request names no pod.
pub const REASON_POD_NAME_EMPTY: &str = "cr podName is empty";

/// Reason recorded when the container has no runtime id.
pub const REASON_CONTAINER_ID_EMPTY: &str = "containerID is empty";

/// When to look at a request again, absent a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Only on the next change.
    OnChange,
    /// After a delay.
    After(Duration),
}

/// How the reconciler gets commit/push done.
pub enum Wiring {
    /// In-process, for pods on `node` only.
    Direct {
        node: String,
        engine: Arc<dyn ImageEngine>,
    },
    /// Node-pinned jobs watched in the background. `engine` is forwarded to
    /// every job.
    Delegated {
        settings: JobSettings,
        engine: EngineOptions,
        watchers: JobWatchers,
    },
}

/// Drives requests through their lifecycle.
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    status: StatusWriter,
    wiring: Wiring,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ClusterClient>, wiring: Wiring, cancel: CancellationToken) -> Self {
        Self {
            status: StatusWriter::new(client.clone()),
            client,
            wiring,
            cancel,
        }
    }

    /// Direct wiring bound to `node`.
    pub fn direct(
        client: Arc<dyn ClusterClient>,
        node: impl Into<String>,
        engine: Arc<dyn ImageEngine>,
        cancel: CancellationToken,
    ) -> Self {
        let wiring = Wiring::Direct {
            node: node.into(),
            engine,
        };
        Self::new(client, wiring, cancel)
    }

    /// Delegated wiring.
    pub fn delegated(
        client: Arc<dyn ClusterClient>,
        settings: JobSettings,
        engine: EngineOptions,
        watchers: JobWatchers,
        cancel: CancellationToken,
    ) -> Self {
        let wiring = Wiring::Delegated {
            settings,
            engine,
            watchers,
        };
        Self::new(client, wiring, cancel)
    }

    /// Reconciles one request.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue> {
        let Some(builder) = self.client.get_builder(key).await? else {
            debug!(request = %key, "request no longer exists");
            return Ok(Requeue::OnChange);
        };
        if builder.metadata.deletion_timestamp.is_some() {
            debug!(request = %key, "request is being deleted");
            return Ok(Requeue::OnChange);
        }

        let status = builder.current_status();
        debug!(request = %key, state = %status.state, node = %status.node, "reconciling");

        match status.state {
            BuildState::Pending => self.locate(key, &builder).await,
            BuildState::Creating => self.dispatch(key, &builder, &status).await,
            BuildState::Running => self.resume(key).await,
            BuildState::Succeeded => self.clean_up(key).await,
            BuildState::Failed => Ok(Requeue::OnChange),
        }
    }

    /// `""`: validate and pin the request to the pod's node.
    async fn locate(&self, key: &ObjectKey, builder: &ImageBuilder) -> Result<Requeue> {
        if builder.spec.pod_name.is_empty() {
            warn!(request = %key, "{}", REASON_POD_NAME_EMPTY);
            self.fail(key, REASON_POD_NAME_EMPTY).await?;
            return Ok(Requeue::OnChange);
        }

        let pod_namespace = builder.pod_namespace();
        let Some(pod) = self
            .client
            .get_pod(&pod_namespace, &builder.spec.pod_name)
            .await?
        else {
            debug!(
                request = %key,
                pod = %builder.spec.pod_name,
                namespace = %pod_namespace,
                "pod not found yet"
            );
            return Ok(Requeue::After(LOOKUP_REQUEUE_DELAY));
        };

        let Some(node) = pod_node_name(&pod) else {
            debug!(request = %key, pod = %builder.spec.pod_name, "pod not scheduled yet");
            return Ok(Requeue::After(LOOKUP_REQUEUE_DELAY));
        };

        if let Wiring::Direct { node: own, .. } = &self.wiring {
            if node != own {
                debug!(request = %key, node, "pod runs on another node, ignoring");
                return Ok(Requeue::OnChange);
            }
        }

        self.status
            .transition(key, BuildState::Creating, "", Some(node))
            .await?;
        Ok(Requeue::OnChange)
    }

    /// `Creating`: resolve the live container id and hand off the work.
    async fn dispatch(
        &self,
        key: &ObjectKey,
        builder: &ImageBuilder,
        status: &ImageBuilderStatus,
    ) -> Result<Requeue> {
        if let Wiring::Direct { node, .. } = &self.wiring {
            if &status.node != node {
                debug!(request = %key, node = %status.node, "request pinned to another node, ignoring");
                return Ok(Requeue::OnChange);
            }
        }

        let pod_namespace = builder.pod_namespace();
        let Some(pod) = self
            .client
            .get_pod(&pod_namespace, &builder.spec.pod_name)
            .await?
        else {
            let reason = format!(
                "pod {}/{} not found (last known node {})",
                pod_namespace, builder.spec.pod_name, status.node
            );
            warn!(request = %key, "{}", reason);
            self.fail(key, &reason).await?;
            return Ok(Requeue::OnChange);
        };

        if let Some(current) = pod_node_name(&pod) {
            if !status.node.is_empty() && current != status.node {
                let reason = format!(
                    "pod {}/{} moved from node {} to {}",
                    pod_namespace, builder.spec.pod_name, status.node, current
                );
                warn!(request = %key, "{}", reason);
                self.fail(key, &reason).await?;
                return Ok(Requeue::OnChange);
            }
        }

        let Some(container_id) = container_id(&pod, &builder.spec.container_name) else {
            warn!(
                request = %key,
                container = %builder.spec.container_name,
                "{}",
                REASON_CONTAINER_ID_EMPTY
            );
            self.fail(key, REASON_CONTAINER_ID_EMPTY).await?;
            return Ok(Requeue::OnChange);
        };

        match &self.wiring {
            Wiring::Direct { engine, .. } => {
                self.run_direct(key, builder, engine.as_ref(), &container_id)
                    .await
            }
            Wiring::Delegated { .. } => {
                self.submit_job(key, builder, status, &container_id).await
            }
        }
    }

    async fn run_direct(
        &self,
        key: &ObjectKey,
        builder: &ImageBuilder,
        engine: &dyn ImageEngine,
        container_id: &str,
    ) -> Result<Requeue> {
        let request =
            ImageRequest::from_builder(builder, container_id, builder.spec.node_save_dir());

        match execute(engine, &request, &self.cancel).await {
            Ok(()) => {
                self.status
                    .transition(key, BuildState::Succeeded, "", None)
                    .await?;
            }
            Err(e) if e.is_cancelled() => {
                info!(request = %key, error = %e, "operation cancelled, status left unchanged");
            }
            Err(e) => {
                error!(request = %key, error = %e, "image operation failed");
                self.fail(key, &e.to_string()).await?;
            }
        }
        Ok(Requeue::OnChange)
    }

    async fn submit_job(
        &self,
        key: &ObjectKey,
        builder: &ImageBuilder,
        status: &ImageBuilderStatus,
        container_id: &str,
    ) -> Result<Requeue> {
        let Wiring::Delegated {
            settings,
            engine,
            watchers,
        } = &self.wiring
        else {
            return Ok(Requeue::OnChange);
        };
        let job = build_job(builder, &status.node, container_id, settings, engine)?;
        let name = job_name(key);

        match self.client.create_job(&job).await {
            Ok(_) => info!(request = %key, job = %name, node = %status.node, "created job"),
            // A previous pass created it but failed before moving to Running.
            Err(Error::Conflict(_)) => {
                debug!(request = %key, job = %name, "job already exists")
            }
            // Resubmitting the same descriptor can never succeed.
            Err(Error::Validation(message)) => {
                let reason = format!("job {} rejected: {}", name, message);
                warn!(request = %key, "{}", reason);
                self.fail(key, &reason).await?;
                return Ok(Requeue::OnChange);
            }
            Err(e) => return Err(e),
        }

        self.status
            .transition(key, BuildState::Running, "", None)
            .await?;
        watchers.watch(key.clone(), settings.namespace.clone(), name);
        Ok(Requeue::OnChange)
    }

    /// `Running`: make sure a watcher owns the job (e.g. after a restart).
    async fn resume(&self, key: &ObjectKey) -> Result<Requeue> {
        let Wiring::Delegated {
            settings, watchers, ..
        } = &self.wiring
        else {
            return Ok(Requeue::OnChange);
        };
        if watchers.is_watching(key) {
            return Ok(Requeue::OnChange);
        }

        let name = job_name(key);
        if self
            .client
            .get_job(&settings.namespace, &name)
            .await?
            .is_none()
        {
            warn!(request = %key, job = %name, "job disappeared, leaving status unchanged");
            return Ok(Requeue::OnChange);
        }

        watchers.watch(key.clone(), settings.namespace.clone(), name);
        Ok(Requeue::OnChange)
    }

    /// `Succeeded`: delete the finished job. Absent jobs are not an error.
    async fn clean_up(&self, key: &ObjectKey) -> Result<Requeue> {
        let Wiring::Delegated { settings, .. } = &self.wiring else {
            return Ok(Requeue::OnChange);
        };

        let name = job_name(key);
        if self
            .client
            .get_job(&settings.namespace, &name)
            .await?
            .is_none()
        {
            return Ok(Requeue::OnChange);
        }

        if self.client.delete_job(&settings.namespace, &name).await? {
            info!(request = %key, job = %name, "deleted finished job");
        }
        Ok(Requeue::OnChange)
    }

    async fn fail(&self, key: &ObjectKey, reason: &str) -> Result<bool> {
        self.status
            .transition(key, BuildState::Failed, reason, None)
            .await
    }
}
