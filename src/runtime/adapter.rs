use crate::errors::ControlSignal;
use crate::invoke::{InvocationPipeline, ToolCallRequest};
use crate::store::types::EventFamily;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

/// Suggested client back-off while an approval is pending.
const PENDING_RETRY_AFTER_MS: u64 = 750;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// Tagged outcome of one tool call, as seen by a runtime. This is also the
/// wire union of the sandbox bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    Ok { value: Value },
    Pending { approval_id: String, retry_after_ms: Option<u64> },
    Denied { error: String },
    Failed { error: String },
}

impl ToolCallOutcome {
    /// Wire form: `{ok:true, value}` or `{ok:false, kind, ...}`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Ok { value } => json!({"ok": true, "value": value}),
            Self::Pending {
                approval_id,
                retry_after_ms,
            } => {
                let mut v = json!({"ok": false, "kind": "pending", "approvalId": approval_id});
                if let Some(ms) = retry_after_ms {
                    v["retryAfterMs"] = json!(ms);
                }
                v
            }
            Self::Denied { error } => json!({"ok": false, "kind": "denied", "error": error}),
            Self::Failed { error } => json!({"ok": false, "kind": "failed", "error": error}),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("ok")?.as_bool()? {
            return Some(Self::Ok {
                value: value.get("value").cloned().unwrap_or(Value::Null),
            });
        }
        match value.get("kind")?.as_str()? {
            "pending" => Some(Self::Pending {
                approval_id: value.get("approvalId")?.as_str()?.to_string(),
                retry_after_ms: value.get("retryAfterMs").and_then(Value::as_u64),
            }),
            "denied" => Some(Self::Denied {
                error: value.get("error")?.as_str()?.to_string(),
            }),
            "failed" => Some(Self::Failed {
                error: value.get("error")?.as_str()?.to_string(),
            }),
            _ => None,
        }
    }
}

/// The bridge a runtime uses to reach back into the control plane.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn invoke_tool(&self, request: ToolCallRequest) -> ToolCallOutcome;

    /// Forward one line of sandbox output. Best effort.
    async fn emit_output(&self, stream: OutputStream, line: &str);
}

/// Adapter for runtimes sharing the control plane's process: calls the
/// pipeline directly and folds thrown control signals into tagged outcomes
/// without losing the approval id.
pub struct InProcessAdapter {
    pipeline: Arc<InvocationPipeline>,
    task_id: String,
}

impl InProcessAdapter {
    pub fn new(pipeline: Arc<InvocationPipeline>, task_id: String) -> Self {
        Self { pipeline, task_id }
    }
}

#[async_trait]
impl ExecutionAdapter for InProcessAdapter {
    async fn invoke_tool(&self, request: ToolCallRequest) -> ToolCallOutcome {
        outcome_from_result(self.pipeline.invoke(&request).await)
    }

    async fn emit_output(&self, stream: OutputStream, line: &str) {
        let journaled = self.pipeline.repo().append_event(
            &self.task_id,
            EventFamily::Task,
            "task.output",
            json!({
                "stream": stream.as_str(),
                "line": line,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        if let Err(e) = journaled {
            warn!("failed to journal output for {}: {:#}", self.task_id, e);
        }
    }
}

/// Fold a pipeline result into the tagged union.
pub fn outcome_from_result(result: Result<Value>) -> ToolCallOutcome {
    match result {
        Ok(value) => ToolCallOutcome::Ok { value },
        Err(e) => match ControlSignal::decode(&e) {
            Some(ControlSignal::ApprovalPending {
                approval_id,
                retry_after_ms,
            }) => ToolCallOutcome::Pending {
                approval_id,
                retry_after_ms: retry_after_ms.or(Some(PENDING_RETRY_AFTER_MS)),
            },
            Some(ControlSignal::ApprovalDenied { reason }) => {
                ToolCallOutcome::Denied { error: reason }
            }
            Some(ControlSignal::TaskTimeout) => ToolCallOutcome::Failed {
                error: "TASK_TIMEOUT".to_string(),
            },
            None => ToolCallOutcome::Failed {
                error: format!("{:#}", e),
            },
        },
    }
}
