//! Commit-then-publish for one request.
//!
//! Shared by the direct reconciler and the delegated `job` process so both
//! wirings run exactly the same engine sequence:
//!
//! ```text
//! commit(container_id, to) ─┬─ operator = push ─▶ push(to, credentials)
//!                           └─ operator = save ─▶ save(to, <dir>/<ref>.tar)
//! ```
//!
//! [`run_job`] is the whole delegated `job` process: re-fetch the request,
//! find the node it is pinned to, connect the engine for that node's
//! runtime, and run [`execute`].

use crate::cluster::{runtime_identifier, ClusterClient};
use crate::config::JobArgs;
use crate::constants::{ARCHIVE_EXTENSION, IMAGE_PUSH_TIMEOUT};
use crate::engine::{run_cancellable, ImageEngine};
use crate::error::{Error, Result};
use crate::registry::RegistryCredentials;
use crate::resource::{ImageBuilder, ObjectKey, Operator};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything the engine needs for one request.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    /// Runtime-local container id, resolved from the live pod.
    pub container_id: String,
    /// Destination reference.
    pub reference: String,
    pub credentials: RegistryCredentials,
    pub operator: Operator,
    /// Directory receiving the archive for `save`.
    pub save_dir: PathBuf,
}

impl ImageRequest {
    /// Builds the request for `builder` with a freshly resolved container id.
    pub fn from_builder(builder: &ImageBuilder, container_id: &str, save_dir: PathBuf) -> Self {
        Self {
            container_id: container_id.to_string(),
            reference: builder.spec.to.clone(),
            credentials: RegistryCredentials::new(
                builder.spec.username.clone(),
                builder.spec.password.clone(),
            ),
            operator: builder.spec.operator,
            save_dir,
        }
    }

    /// Archive path for `save`.
    pub fn archive_path(&self) -> PathBuf {
        archive_path(&self.save_dir, &self.reference)
    }
}

/// `<dir>/<reference with / : @ replaced by _>.tar`.
pub fn archive_path(dir: &Path, reference: &str) -> PathBuf {
    let name: String = reference
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            c => c,
        })
        .collect();
    dir.join(format!("{}.{}", name, ARCHIVE_EXTENSION))
}

/// Commits the container, then pushes or saves the image.
///
/// Engine failures come back as [`Error::Engine`]; cancellation as
/// [`crate::error::EngineError::Cancelled`] so callers never persist it.
pub async fn execute(
    engine: &dyn ImageEngine,
    request: &ImageRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(
        engine = engine.name(),
        container_id = %request.container_id,
        reference = %request.reference,
        operator = %request.operator,
        "committing container"
    );
    run_cancellable(
        cancel,
        "commit",
        engine.commit(&request.container_id, &request.reference),
    )
    .await?;

    match request.operator {
        Operator::Push => {
            let push = run_cancellable(
                cancel,
                "push",
                engine.push(&request.reference, &request.credentials),
            );
            tokio::time::timeout(IMAGE_PUSH_TIMEOUT, push)
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("push {}", request.reference),
                    duration: IMAGE_PUSH_TIMEOUT,
                })??;
        }
        Operator::Save => {
            let path = request.archive_path();
            run_cancellable(cancel, "save", engine.save(&request.reference, &path)).await?;
        }
    }

    info!(reference = %request.reference, operator = %request.operator, "image published");
    Ok(())
}

/// Runs the delegated job for `args`.
///
/// `connect` receives the node's runtime identifier and returns the engine
/// for it. The container id comes from the job arguments, resolved by the
/// controller when the job was created. Any error fails the job process,
/// which the controller observes through the job's conditions.
pub async fn run_job<F, Fut, E>(
    client: &dyn ClusterClient,
    args: &JobArgs,
    connect: F,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<E>>,
    E: ImageEngine,
{
    args.validate()?;
    let key = ObjectKey::new(args.namespace.clone(), args.name.clone());

    let builder = client
        .get_builder(&key)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "imagebuilder",
            name: key.to_string(),
        })?;

    let node = builder.current_status().node;
    if node.is_empty() {
        return Err(Error::Validation(format!("{} has no node recorded", key)));
    }

    let identifier = runtime_identifier(client, &node).await?;
    info!(request = %key, node = %node, runtime = %identifier, "running job");
    let engine = connect(identifier).await?;

    let request =
        ImageRequest::from_builder(&builder, &args.container_id, builder.spec.job_save_dir());
    execute(&engine, &request, cancel).await
}
