use crate::errors::ControlSignal;
use crate::store::Repository;
use crate::store::types::{Approval, ApprovalStatus, EventFamily};
use anyhow::{Context, Result, bail};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Poll cadence for stores without push.
const POLL_INTERVAL: Duration = Duration::from_millis(750);

/// Upper bound on any wait, independent of the task timeout.
pub const MAX_WAIT: Duration = Duration::from_secs(15 * 60);

/// Creates, resolves, and waits on approvals. Resolution always publishes
/// `approval.resolved` into the owning task's journal.
pub struct ApprovalCoordinator {
    repo: Arc<Repository>,
}

impl ApprovalCoordinator {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    pub fn create(&self, task_id: &str, tool_path: &str, input: serde_json::Value) -> Result<Approval> {
        self.repo.create_approval(task_id, tool_path, input)
    }

    /// Resolve a pending approval. Returns `None` (no side effect) when the
    /// approval is unknown, already resolved, or owned by another workspace.
    pub fn resolve(
        &self,
        workspace_id: &str,
        approval_id: &str,
        decision: ApprovalStatus,
        reviewer_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Option<Approval>> {
        if decision == ApprovalStatus::Pending {
            bail!("decision must be approved or denied");
        }
        let Some(approval) =
            self.repo
                .resolve_approval(workspace_id, approval_id, decision, reviewer_id, reason)?
        else {
            return Ok(None);
        };

        self.repo.append_event(
            &approval.task_id,
            EventFamily::Approval,
            "approval.resolved",
            json!({
                "approvalId": approval.id,
                "toolPath": approval.tool_path,
                "decision": decision.as_str(),
                "reviewerId": reviewer_id,
                "reason": reason,
                "pendingApprovalCount": self.repo.pending_approval_count(&approval.task_id)?,
            }),
        )?;
        info!(
            "approval {} resolved {} by {}",
            approval.id,
            decision.as_str(),
            reviewer_id.unwrap_or("unknown")
        );
        Ok(Some(approval))
    }

    /// Wait by re-reading the approval row on a fixed cadence. The fallback
    /// for environments where the store cannot push.
    ///
    /// A denied resolution surfaces as [`ControlSignal::ApprovalDenied`];
    /// running past `timeout` is an error.
    pub async fn wait_polling(&self, approval_id: &str, timeout: Duration) -> Result<Approval> {
        let deadline = tokio::time::Instant::now() + timeout.min(MAX_WAIT);
        loop {
            let approval = self
                .repo
                .get_approval(approval_id)?
                .with_context(|| format!("approval {} not found", approval_id))?;
            match approval.status {
                ApprovalStatus::Approved => return Ok(approval),
                ApprovalStatus::Denied => {
                    return Err(ControlSignal::ApprovalDenied {
                        reason: approval
                            .reason
                            .unwrap_or_else(|| "approval denied".to_string()),
                    }
                    .into());
                }
                ApprovalStatus::Pending => {}
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("timed out waiting for approval {}", approval_id);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait on the task's live event stream: resumes when this approval
    /// resolves, when the task's pending count drains to zero, or when the
    /// task reaches a terminal state.
    pub async fn wait_subscribed(&self, approval_id: &str, timeout: Duration) -> Result<Approval> {
        let approval = self
            .repo
            .get_approval(approval_id)?
            .with_context(|| format!("approval {} not found", approval_id))?;
        // Subscribe before the re-read below so no resolution slips between.
        let mut events = self.repo.hub().subscribe(&approval.task_id);

        let check = |approval: Approval| -> Option<Result<Approval>> {
            match approval.status {
                ApprovalStatus::Approved => Some(Ok(approval)),
                ApprovalStatus::Denied => Some(Err(ControlSignal::ApprovalDenied {
                    reason: approval
                        .reason
                        .clone()
                        .unwrap_or_else(|| "approval denied".to_string()),
                }
                .into())),
                ApprovalStatus::Pending => None,
            }
        };
        if let Some(settled) = check(
            self.repo
                .get_approval(approval_id)?
                .context("approval vanished")?,
        ) {
            return settled;
        }

        let deadline = tokio::time::Instant::now() + timeout.min(MAX_WAIT);
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                () = tokio::time::sleep_until(deadline) => {
                    bail!("timed out waiting for approval {}", approval_id);
                }
            };
            match event {
                Ok(event) => {
                    let resolved_here = event.event_type == "approval.resolved"
                        && event.payload["approvalId"] == json!(approval_id);
                    let drained = event.payload["pendingApprovalCount"] == json!(0);
                    let terminal = matches!(
                        event.event_type.as_str(),
                        "task.completed" | "task.failed" | "task.timed_out" | "task.denied"
                    );
                    if resolved_here || drained || terminal {
                        debug!(
                            "approval wait on {} woken by {}",
                            approval_id, event.event_type
                        );
                        if let Some(settled) = check(
                            self.repo
                                .get_approval(approval_id)?
                                .context("approval vanished")?,
                        ) {
                            return settled;
                        }
                        if terminal {
                            bail!(
                                "task {} ended while approval {} was pending",
                                approval.task_id,
                                approval_id
                            );
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Dropped events: re-read the row instead of trusting
                    // the stream.
                    if let Some(settled) = check(
                        self.repo
                            .get_approval(approval_id)?
                            .context("approval vanished")?,
                    ) {
                        return settled;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    bail!("event stream closed while waiting for approval {}", approval_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
