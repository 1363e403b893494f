//! Guarded status transitions.
//!
//! Every write re-reads the request first and only proceeds if the move is
//! forward in the state machine (see
//! [`BuildState::can_transition_to`](crate::resource::BuildState::can_transition_to)).
//! The write itself is conditional on the resourceVersion just read, so a
//! concurrent writer makes it fail with a conflict instead of being
//! clobbered. Conflicts and throttling are retried with exponential backoff,
//! re-reading each time.
//!
//! This is what lets a detached job watcher and the reconciler both write
//! status for the same request without ever producing two terminal
//! transitions or resurrecting a deleted object.

use crate::cluster::ClusterClient;
use crate::constants::{STATUS_UPDATE_ATTEMPTS, STATUS_UPDATE_BACKOFF};
use crate::error::{Error, Result};
use crate::resource::{BuildState, ImageBuilderStatus, ObjectKey};
use std::sync::Arc;
use tracing::{debug, info};

/// Writes status transitions for requests.
#[derive(Clone)]
pub struct StatusWriter {
    client: Arc<dyn ClusterClient>,
}

impl StatusWriter {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Moves `key` to `target`.
    ///
    /// `reason` is recorded only for `Failed`. `node` is recorded only if the
    /// status has none yet; an existing node is never overwritten.
    ///
    /// Returns `Ok(false)` without writing if the request is gone, being
    /// deleted, or already at or past `target`.
    pub async fn transition(
        &self,
        key: &ObjectKey,
        target: BuildState,
        reason: &str,
        node: Option<&str>,
    ) -> Result<bool> {
        let mut backoff = STATUS_UPDATE_BACKOFF;

        for attempt in 1..=STATUS_UPDATE_ATTEMPTS {
            let Some(builder) = self.client.get_builder(key).await? else {
                debug!(request = %key, %target, "request gone, skipping status update");
                return Ok(false);
            };
            if builder.metadata.deletion_timestamp.is_some() {
                debug!(request = %key, %target, "request being deleted, skipping status update");
                return Ok(false);
            }

            let current = builder.current_status();
            if !current.state.can_transition_to(target) {
                debug!(
                    request = %key,
                    current = %current.state,
                    %target,
                    "transition not allowed, skipping status update"
                );
                return Ok(false);
            }

            let next = ImageBuilderStatus {
                state: target,
                reason: if target == BuildState::Failed {
                    reason.to_string()
                } else {
                    String::new()
                },
                node: if current.node.is_empty() {
                    node.unwrap_or_default().to_string()
                } else {
                    current.node.clone()
                },
            };

            match self.client.update_builder_status(&builder, &next).await {
                Ok(_) => {
                    info!(
                        request = %key,
                        from = %current.state,
                        to = %next.state,
                        node = %next.node,
                        reason = %next.reason,
                        "status updated"
                    );
                    return Ok(true);
                }
                Err(e) if e.is_transient() && attempt < STATUS_UPDATE_ATTEMPTS => {
                    debug!(request = %key, attempt, error = %e, "status update retry");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Internal(format!(
            "status update for {} exhausted {} attempts",
            key, STATUS_UPDATE_ATTEMPTS
        )))
    }
}
