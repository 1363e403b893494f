//! Watch loop.
//!
//! Wires a [`Reconciler`] into `kube`'s controller runtime. The runtime
//! owns the work queue: it serializes reconciles per key, bounds the number
//! of keys in flight, and coalesces bursts of events. Job events are mapped
//! back to their request through the job's labels so a finished job wakes
//! its request without waiting for the poller.

use crate::cluster::{runtime_identifier, ClusterClient, KubeCluster};
use crate::config::{ControllerConfig, ExecutionMode};
use crate::constants::{
    ERROR_REQUEUE_DELAY, LABEL_MANAGED_BY, MANAGER_NAME, TRANSIENT_REQUEUE_DELAY,
};
use crate::engine::{Engine, ImageEngine};
use crate::error::{Error, Result};
use crate::job::request_key;
use crate::poller::{JobPoller, JobWatchers};
use crate::reconciler::{Reconciler, Requeue};
use crate::resource::{ImageBuilder, ObjectKey};
use crate::selector;
use crate::status::StatusWriter;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Context {
    reconciler: Reconciler,
}

/// Runs the controller until `shutdown` is cancelled.
pub async fn run(
    cluster: KubeCluster,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;

    let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
    let (reconciler, watchers) = match config.mode {
        ExecutionMode::Direct => {
            let node = config.node_name.clone().unwrap_or_default();
            let engine = local_engine(client.as_ref(), &node, &config).await?;
            info!(node = %node, engine = engine.name(), "direct mode");
            let reconciler = Reconciler::direct(client.clone(), node, engine, shutdown.clone());
            (reconciler, None)
        }
        ExecutionMode::Delegated => {
            let poller =
                JobPoller::new(client.clone(), config.poll_interval, config.poll_deadline);
            let watchers = JobWatchers::new(
                poller,
                StatusWriter::new(client.clone()),
                shutdown.child_token(),
            );
            info!(
                job_namespace = %config.job.namespace,
                job_image = %config.job.image,
                "delegated mode"
            );
            let reconciler = Reconciler::delegated(
                client.clone(),
                config.job.clone(),
                config.engine.clone(),
                watchers.clone(),
                shutdown.clone(),
            );
            (reconciler, Some(watchers))
        }
    };

    let builders: Api<ImageBuilder> = match &config.watch_namespace {
        Some(ns) => Api::namespaced(cluster.client().clone(), ns),
        None => Api::all(cluster.client().clone()),
    };

    let mut runner = Controller::new(builders, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.max_concurrent_reconciles));

    if config.mode == ExecutionMode::Delegated {
        let jobs: Api<Job> = Api::namespaced(cluster.client().clone(), &config.job.namespace);
        let selector = format!("{}={}", LABEL_MANAGED_BY, MANAGER_NAME);
        runner = runner.watches(
            jobs,
            watcher::Config::default().labels(&selector),
            |job: Job| {
                request_key(&job.metadata)
                    .map(|key| ObjectRef::new(&key.name).within(&key.namespace))
            },
        );
    }

    info!(
        mode = %config.mode,
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        workers = config.max_concurrent_reconciles,
        "starting controller"
    );

    let context = Arc::new(Context { reconciler });
    runner
        .graceful_shutdown_on(shutdown.clone().cancelled_owned())
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(request = %obj, "reconciled"),
                Err(controller::Error::ReconcilerFailed(e, obj)) => {
                    warn!(request = %obj, error = %e, "reconcile failed")
                }
                Err(e) => debug!(error = %e, "controller event"),
            }
        })
        .await;

    if let Some(watchers) = watchers {
        watchers.shutdown().await;
    }
    info!("controller stopped");
    Ok(())
}

async fn reconcile(builder: Arc<ImageBuilder>, ctx: Arc<Context>) -> Result<Action> {
    let key = ObjectKey::from_resource(&builder)?;
    let requeue = ctx.reconciler.reconcile(&key).await?;
    Ok(to_action(requeue))
}

fn error_policy(builder: Arc<ImageBuilder>, err: &Error, _ctx: Arc<Context>) -> Action {
    let delay = requeue_delay(err);
    if err.is_transient() {
        debug!(request = %builder.name_any(), error = %err, ?delay, "transient error, requeueing");
    } else {
        error!(request = %builder.name_any(), error = %err, ?delay, "reconcile error, requeueing");
    }
    Action::requeue(delay)
}

/// Maps a reconcile outcome onto a controller action.
pub fn to_action(requeue: Requeue) -> Action {
    match requeue {
        Requeue::OnChange => Action::await_change(),
        Requeue::After(delay) => Action::requeue(delay),
    }
}

/// Delay before retrying a request whose reconcile failed.
pub fn requeue_delay(err: &Error) -> std::time::Duration {
    if err.is_transient() {
        TRANSIENT_REQUEUE_DELAY
    } else {
        ERROR_REQUEUE_DELAY
    }
}

/// Connects the engine for the node this direct-mode controller runs on.
async fn local_engine(
    client: &dyn ClusterClient,
    node: &str,
    config: &ControllerConfig,
) -> Result<Arc<dyn ImageEngine>> {
    let identifier = runtime_identifier(client, node).await?;
    let engine: Engine = selector::select(&identifier, &config.engine).await?;
    Ok(Arc::new(engine))
}
