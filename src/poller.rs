//! Job lifecycle poller.
//!
//! [`JobPoller::wait`] checks a job on a fixed interval until it reports a
//! terminal condition, disappears, runs past the deadline, or the owning
//! context is cancelled. It never holds a reconcile slot: [`JobWatchers`]
//! runs one detached watcher per request and applies the outcome through
//! the guarded [`StatusWriter`], so at most one terminal status is ever
//! written per job.
//!
//! | Outcome | Status |
//! |---------|--------|
//! | `Complete` | `Succeeded` (job deleted by the next reconcile) |
//! | `Failed(message)` | `Failed`, reason = condition message |
//! | `TimedOut` | `Failed`, reason names the deadline |
//! | `Vanished` | unchanged (external deletion), warning logged |
//! | `Cancelled` | unchanged |

use crate::cluster::ClusterClient;
use crate::resource::{BuildState, ObjectKey};
use crate::status::StatusWriter;
use k8s_openapi::api::batch::v1::Job;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How a watched job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job reported `Complete`.
    Complete,
    /// The job reported `Failed`; carries the condition message.
    Failed(String),
    /// The job no longer exists.
    Vanished,
    /// The deadline passed without a terminal condition.
    TimedOut,
    /// The watch was cancelled.
    Cancelled,
}

/// Returns the terminal outcome recorded in a job's conditions, if any.
pub fn terminal_outcome(job: &Job) -> Option<JobOutcome> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return Some(JobOutcome::Complete),
            "Failed" => {
                let message = condition
                    .message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "job failed".to_string());
                return Some(JobOutcome::Failed(message));
            }
            _ => {}
        }
    }
    None
}

/// Polls one job until it reaches a terminal state.
#[derive(Clone)]
pub struct JobPoller {
    client: Arc<dyn ClusterClient>,
    interval: Duration,
    deadline: Duration,
}

impl JobPoller {
    pub fn new(client: Arc<dyn ClusterClient>, interval: Duration, deadline: Duration) -> Self {
        Self {
            client,
            interval,
            deadline,
        }
    }

    /// Waits for job `namespace/name`.
    ///
    /// The first check happens immediately. Lookup errors are logged and
    /// the poll continues; only the deadline bounds a flapping API server.
    pub async fn wait(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> JobOutcome {
        let deadline = tokio::time::sleep_until(Instant::now() + self.deadline);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return JobOutcome::Cancelled,
                _ = &mut deadline => return JobOutcome::TimedOut,
                _ = ticker.tick() => {}
            }

            match self.client.get_job(namespace, name).await {
                Ok(None) => return JobOutcome::Vanished,
                Ok(Some(job)) => {
                    if let Some(outcome) = terminal_outcome(&job) {
                        return outcome;
                    }
                    debug!(job = name, namespace, "job still running");
                }
                Err(e) => warn!(job = name, namespace, error = %e, "failed to get job status"),
            }
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

// =============================================================================
// Detached watchers
// =============================================================================

/// Detached per-request job watchers.
///
/// At most one watcher runs per request key; [`Self::watch`] on a key that
/// is already watched is a no-op.
#[derive(Clone)]
pub struct JobWatchers {
    inner: Arc<WatchersInner>,
}

struct WatchersInner {
    poller: JobPoller,
    status: StatusWriter,
    active: Mutex<HashSet<ObjectKey>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl JobWatchers {
    pub fn new(poller: JobPoller, status: StatusWriter, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(WatchersInner {
                poller,
                status,
                active: Mutex::new(HashSet::new()),
                cancel,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Returns true if a watcher for `key` is running.
    pub fn is_watching(&self, key: &ObjectKey) -> bool {
        self.inner
            .active
            .lock()
            .map(|a| a.contains(key))
            .unwrap_or(false)
    }

    /// Starts watching job `job_namespace/job_name` on behalf of `key`.
    ///
    /// Returns false if a watcher for `key` already runs.
    pub fn watch(&self, key: ObjectKey, job_namespace: String, job_name: String) -> bool {
        match self.inner.active.lock() {
            Ok(mut active) => {
                if !active.insert(key.clone()) {
                    return false;
                }
            }
            Err(_) => return false,
        }

        info!(request = %key, job = %job_name, namespace = %job_namespace, "watching job");
        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            let _active = ActiveGuard {
                inner: inner.clone(),
                key: key.clone(),
            };
            let outcome = inner
                .poller
                .wait(&job_namespace, &job_name, &inner.cancel)
                .await;
            apply_outcome(&inner, &key, &job_name, outcome).await;
        });
        true
    }

    /// Cancels all watchers and waits for them to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

async fn apply_outcome(inner: &WatchersInner, key: &ObjectKey, job_name: &str, outcome: JobOutcome) {
    let result = match &outcome {
        JobOutcome::Complete => {
            info!(request = %key, job = job_name, "job complete");
            inner
                .status
                .transition(key, BuildState::Succeeded, "", None)
                .await
        }
        JobOutcome::Failed(message) => {
            warn!(request = %key, job = job_name, message = %message, "job failed");
            inner
                .status
                .transition(key, BuildState::Failed, message, None)
                .await
        }
        JobOutcome::TimedOut => {
            let reason = format!(
                "job {} did not finish within {:?}",
                job_name,
                inner.poller.deadline()
            );
            warn!(request = %key, job = job_name, "job timed out");
            inner
                .status
                .transition(key, BuildState::Failed, &reason, None)
                .await
        }
        JobOutcome::Vanished => {
            warn!(request = %key, job = job_name, "job disappeared before finishing, leaving status unchanged");
            return;
        }
        JobOutcome::Cancelled => {
            debug!(request = %key, job = job_name, "job watch cancelled");
            return;
        }
    };

    if let Err(e) = result {
        error!(request = %key, job = job_name, error = %e, ?outcome, "failed to record job outcome");
    }
}

struct ActiveGuard {
    inner: Arc<WatchersInner>,
    key: ObjectKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.inner.active.lock() {
            active.remove(&self.key);
        }
    }
}
