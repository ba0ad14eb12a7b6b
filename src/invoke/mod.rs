pub mod system;

use crate::credentials;
use crate::errors::{ControlSignal, ExecutorError};
use crate::policy::{self, Decision, PolicyContext, PolicyTool};
use crate::registry::{Resolution, ToolRegistry};
use crate::sources::{SerializedTool, ToolExecutor, ToolRunContext, ToolSpec, sanitize_segment};
use crate::store::Repository;
use crate::store::types::{
    ApprovalMode, ApprovalStatus, EventFamily, Task, ToolCall, ToolCallStatus,
};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One tool call as requested by a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub run_id: String,
    pub call_id: String,
    pub tool_path: String,
    #[serde(default)]
    pub input: Value,
}

/// The tool invocation pipeline: persist, resolve, gate, execute, journal.
///
/// Control flow leaves through errors: [`ControlSignal::ApprovalPending`]
/// suspends the caller, [`ControlSignal::ApprovalDenied`] terminates the
/// task, anything else is a plain failure.
pub struct InvocationPipeline {
    repo: Arc<Repository>,
    registry: Arc<ToolRegistry>,
    executor: ToolExecutor,
}

impl InvocationPipeline {
    pub fn new(repo: Arc<Repository>, registry: Arc<ToolRegistry>, executor: ToolExecutor) -> Self {
        Self {
            repo,
            registry,
            executor,
        }
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub async fn invoke(&self, request: &ToolCallRequest) -> Result<Value> {
        let task = self
            .repo
            .get_task(&request.run_id)?
            .with_context(|| format!("task {} not found", request.run_id))?;
        let ctx = PolicyContext {
            workspace_id: task.workspace_id.clone(),
            organization_id: task
                .metadata
                .get("organizationId")
                .and_then(Value::as_str)
                .map(str::to_string),
            account_id: task.account_id.clone(),
            client_id: task
                .metadata
                .get("clientId")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        // Step 1: persist the request; replays short-circuit to the cached
        // outcome without re-executing anything.
        let (call, created) = self.repo.upsert_tool_call_requested(
            &request.run_id,
            &request.call_id,
            &request.tool_path,
            &request.input,
        )?;
        if call.status.is_settled() {
            debug!(
                "replaying settled tool call {}:{} ({})",
                request.run_id,
                request.call_id,
                call.status.as_str()
            );
            return self.replay_settled(&call);
        }

        // Step 2: system tools run in-process against the registry.
        if system::is_system_path(&request.tool_path) {
            return self.invoke_system(&task, &call, &ctx, request, created);
        }

        // Step 3: resolve against the ready catalog, building on demand.
        self.registry
            .ensure_ready(&task.workspace_id)
            .await
            .context("registry build failed")?;
        let entry = match self.registry.resolve(&task.workspace_id, &request.tool_path)? {
            Resolution::Found(entry) => entry,
            Resolution::Unknown { suggestions } => {
                let err = ExecutorError::UnknownTool {
                    path: request.tool_path.clone(),
                    suggestions,
                };
                let message = err.to_string();
                self.fail_call(&task, &call, &message)?;
                return Err(err.into());
            }
        };
        let tool: SerializedTool = serde_json::from_value(
            entry.tool.clone().context("registry entry has no tool payload")?,
        )
        .context("corrupt serialized tool payload")?;

        // Step 4: policy. GraphQL entry tools evaluate the strictest
        // decision across the per-field pseudo paths.
        let policies = self.repo.list_policies(&task.workspace_id)?;
        let (decision, effective_paths) = if let ToolSpec::GraphqlExecutor { .. } = &tool.spec {
            let paths = graphql_effective_paths(&tool, &request.input);
            match &paths {
                Some(paths) => {
                    let tools: Vec<PolicyTool<'_>> = paths
                        .iter()
                        .map(|(path, mode)| PolicyTool {
                            path,
                            source_key: &tool.source_key,
                            default_approval: *mode,
                        })
                        .collect();
                    (
                        policy::decide_strictest(tools, &ctx, &policies, Some(&request.input)),
                        Some(paths.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>()),
                    )
                }
                None => {
                    let message = format!(
                        "{}: could not parse the GraphQL query for policy evaluation",
                        request.tool_path
                    );
                    self.fail_call(&task, &call, &message)?;
                    return Err(anyhow!(message));
                }
            }
        } else {
            let policy_tool = PolicyTool {
                path: &entry.path,
                source_key: &tool.source_key,
                default_approval: tool.approval,
            };
            (
                policy::decide(&policy_tool, &ctx, &policies, Some(&request.input)),
                None,
            )
        };

        // Step 5: policy deny fails fast, before any approval row exists.
        if decision == Decision::Deny {
            return Err(self.deny_call(&task, &call, "policy_deny", &effective_paths)?);
        }

        // Step 6: credentials resolve fresh per call and never outlive it.
        let credential = if tool.requires_credential {
            match credentials::find_credential(
                &self.repo,
                &task.workspace_id,
                &task.account_id,
                &tool.source_key,
            )? {
                Some(record) => Some(credentials::resolve(&record)?),
                None => {
                    let message = format!(
                        "{}: no credential found for source {}",
                        request.tool_path, tool.source_key
                    );
                    self.fail_call(&task, &call, &message)?;
                    return Err(anyhow!(message));
                }
            }
        } else {
            None
        };

        // Step 7: journal the start, but only on the first attempt — a
        // replay after approval resolution stays silent.
        if created {
            self.repo.append_event(
                &task.id,
                EventFamily::Task,
                "tool.call.started",
                started_payload(&request.call_id, &entry.path, &effective_paths),
            )?;
        }

        // Step 8: approval gate.
        if let Some(approval_id) = &call.approval_id {
            let approval = self
                .repo
                .get_approval(approval_id)?
                .with_context(|| format!("approval {} not found", approval_id))?;
            match approval.status {
                ApprovalStatus::Pending => {
                    return Err(ControlSignal::ApprovalPending {
                        approval_id: approval.id,
                        retry_after_ms: None,
                    }
                    .into());
                }
                ApprovalStatus::Denied => {
                    let reason = approval
                        .reason
                        .unwrap_or_else(|| "approval denied".to_string());
                    return Err(self.deny_call(&task, &call, &reason, &effective_paths)?);
                }
                ApprovalStatus::Approved => {
                    debug!(
                        "tool call {}:{} resuming with approval {}",
                        task.id, call.call_id, approval.id
                    );
                }
            }
        } else if decision == Decision::RequireApproval {
            let approval =
                self.repo
                    .create_approval(&task.id, &entry.path, request.input.clone())?;
            self.repo
                .set_tool_call_pending_approval(&task.id, &call.call_id, &approval.id)?;
            self.repo.append_event(
                &task.id,
                EventFamily::Approval,
                "approval.requested",
                json!({
                    "approvalId": approval.id,
                    "callId": call.call_id,
                    "toolPath": entry.path,
                    "pendingApprovalCount": self.repo.pending_approval_count(&task.id)?,
                }),
            )?;
            info!(
                "tool call {}:{} suspended pending approval {}",
                task.id, call.call_id, approval.id
            );
            return Err(ControlSignal::ApprovalPending {
                approval_id: approval.id,
                retry_after_ms: None,
            }
            .into());
        }

        // Step 9: execute. Output JSON is never journaled.
        let run_ctx = ToolRunContext {
            task_id: &task.id,
            call_id: &call.call_id,
            workspace_id: &task.workspace_id,
            account_id: &task.account_id,
            client_id: ctx.client_id.as_deref(),
            credential: credential.as_ref(),
        };
        match self.executor.run(&tool, &request.input, &run_ctx).await {
            Ok(output) => {
                self.repo.settle_tool_call(
                    &task.id,
                    &call.call_id,
                    ToolCallStatus::Completed,
                    Some(&output),
                    None,
                )?;
                self.repo.append_event(
                    &task.id,
                    EventFamily::Task,
                    "tool.call.completed",
                    completed_payload(&call.call_id, &entry.path, &effective_paths),
                )?;
                Ok(output)
            }
            Err(e) => {
                let message = format!("{}: {:#}", entry.path, e);
                self.fail_call(&task, &call, &message)?;
                Err(anyhow!(message))
            }
        }
    }

    fn replay_settled(&self, call: &ToolCall) -> Result<Value> {
        match call.status {
            ToolCallStatus::Completed => Ok(call.output.clone().unwrap_or(Value::Null)),
            ToolCallStatus::Denied => Err(ControlSignal::ApprovalDenied {
                reason: call
                    .error
                    .clone()
                    .unwrap_or_else(|| "approval denied".to_string()),
            }
            .into()),
            ToolCallStatus::Failed => Err(anyhow!(
                "{}",
                call.error.clone().unwrap_or_else(|| "tool call failed".to_string())
            )),
            ToolCallStatus::Requested | ToolCallStatus::PendingApproval => {
                unreachable!("replay_settled called for an unsettled call")
            }
        }
    }

    /// System tools run against the current registry only; a stale or
    /// absent catalog surfaces as `RegistryNotReady`, never a source scan.
    fn invoke_system(
        &self,
        task: &Task,
        call: &ToolCall,
        ctx: &PolicyContext,
        request: &ToolCallRequest,
        created: bool,
    ) -> Result<Value> {
        let policies = self.repo.list_policies(&task.workspace_id)?;
        let policy_tool = PolicyTool {
            path: &request.tool_path,
            source_key: "system",
            default_approval: ApprovalMode::Auto,
        };
        if policy::decide(&policy_tool, ctx, &policies, Some(&request.input)) == Decision::Deny {
            return Err(self.deny_call(task, call, "policy_deny", &None)?);
        }

        if created {
            self.repo.append_event(
                &task.id,
                EventFamily::Task,
                "tool.call.started",
                started_payload(&request.call_id, &request.tool_path, &None),
            )?;
        }
        match system::run_system_tool(
            &self.repo,
            &self.registry,
            &task.workspace_id,
            &request.tool_path,
            &request.input,
        ) {
            Ok(output) => {
                self.repo.settle_tool_call(
                    &task.id,
                    &call.call_id,
                    ToolCallStatus::Completed,
                    Some(&output),
                    None,
                )?;
                self.repo.append_event(
                    &task.id,
                    EventFamily::Task,
                    "tool.call.completed",
                    completed_payload(&call.call_id, &request.tool_path, &None),
                )?;
                Ok(output)
            }
            Err(e) => {
                let message = format!("{}: {:#}", request.tool_path, e);
                self.fail_call(task, call, &message)?;
                Err(anyhow!(message))
            }
        }
    }

    /// Mark the call failed and journal it. The caller re-throws.
    fn fail_call(&self, task: &Task, call: &ToolCall, message: &str) -> Result<()> {
        warn!("tool call {}:{} failed: {}", task.id, call.call_id, message);
        self.repo.settle_tool_call(
            &task.id,
            &call.call_id,
            ToolCallStatus::Failed,
            None,
            Some(message),
        )?;
        self.repo.append_event(
            &task.id,
            EventFamily::Task,
            "tool.call.failed",
            json!({"callId": call.call_id, "toolPath": call.tool_path, "error": message}),
        )?;
        Ok(())
    }

    /// Mark the call denied, journal it, and hand back the control signal.
    fn deny_call(
        &self,
        task: &Task,
        call: &ToolCall,
        reason: &str,
        effective_paths: &Option<Vec<String>>,
    ) -> Result<anyhow::Error> {
        info!(
            "tool call {}:{} denied: {}",
            task.id, call.call_id, reason
        );
        self.repo.settle_tool_call(
            &task.id,
            &call.call_id,
            ToolCallStatus::Denied,
            None,
            Some(&format!("{}: {}", call.tool_path, reason)),
        )?;
        let mut payload = json!({
            "callId": call.call_id,
            "toolPath": call.tool_path,
            "reason": reason,
        });
        if let Some(paths) = effective_paths {
            payload["effectivePaths"] = json!(paths);
        }
        self.repo
            .append_event(&task.id, EventFamily::Task, "tool.call.denied", payload)?;
        Ok(ControlSignal::ApprovalDenied {
            reason: format!("{}: {}", call.tool_path, reason),
        }
        .into())
    }
}

fn started_payload(call_id: &str, tool_path: &str, effective_paths: &Option<Vec<String>>) -> Value {
    let mut payload = json!({"callId": call_id, "toolPath": tool_path});
    if let Some(paths) = effective_paths {
        payload["effectivePaths"] = json!(paths);
    }
    payload
}

fn completed_payload(
    call_id: &str,
    tool_path: &str,
    effective_paths: &Option<Vec<String>>,
) -> Value {
    let mut payload = json!({
        "callId": call_id,
        "toolPath": tool_path,
        "outputRedacted": true,
    });
    if let Some(paths) = effective_paths {
        payload["effectivePaths"] = json!(paths);
    }
    payload
}

/// Synthetic per-field paths for a GraphQL executor call, with each field's
/// default approval (queries auto, mutations required). `None` when the
/// document does not parse.
fn graphql_effective_paths(
    tool: &SerializedTool,
    input: &Value,
) -> Option<Vec<(String, ApprovalMode)>> {
    let query = input.get("query").and_then(Value::as_str)?;
    let (operation, fields) = policy::graphql_top_level_fields(query)?;
    let source_segment = tool.path.strip_suffix(".graphql").unwrap_or(&tool.path);
    let default = match operation {
        policy::GraphqlOperation::Query => ApprovalMode::Auto,
        policy::GraphqlOperation::Mutation => ApprovalMode::Required,
    };
    Some(
        fields
            .iter()
            .map(|field| {
                (
                    format!(
                        "{}.{}.{}",
                        source_segment,
                        operation.as_str(),
                        sanitize_segment(field)
                    ),
                    default,
                )
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests;
