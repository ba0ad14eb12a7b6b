use thiserror::Error;

/// Typed error hierarchy for codeplane.
///
/// Used at module boundaries (the invocation pipeline, registry reads).
/// Internal/leaf functions use `anyhow::Result` — the `Internal` variant
/// converts seamlessly via the `?` operator.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Registry reads with a build id whose state is not `ready`.
    #[error("registry not ready for workspace {workspace_id}; request a rebuild and retry")]
    RegistryNotReady { workspace_id: String },

    #[error("{}", unknown_tool_message(.path, .suggestions))]
    UnknownTool {
        path: String,
        suggestions: Vec<String>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn unknown_tool_message(path: &str, suggestions: &[String]) -> String {
    let mut msg = format!("Unknown tool: {}.", path);
    if !suggestions.is_empty() {
        msg.push_str(&format!(" Did you mean: {}?", suggestions.join(", ")));
    }
    msg.push_str(&format!(
        " Use discover(\"{}\") to search the catalog.",
        path.split('.').next().unwrap_or(path)
    ));
    msg
}

/// Non-error control flow propagated through error channels.
///
/// The invocation pipeline throws these to suspend (`ApprovalPending`) or
/// terminate (`ApprovalDenied`) a run; the scheduler and execution adapter
/// decode them back out of wrapped `anyhow::Error` values. `TaskTimeout` is
/// raised by runtimes when the task deadline elapses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlSignal {
    #[error("approval_pending:{approval_id}")]
    ApprovalPending {
        approval_id: String,
        retry_after_ms: Option<u64>,
    },

    #[error("approval_denied:{reason}")]
    ApprovalDenied { reason: String },

    #[error("TASK_TIMEOUT")]
    TaskTimeout,
}

impl ControlSignal {
    /// Recover a control signal from an arbitrary error value.
    ///
    /// Tries a typed downcast through the whole cause chain first, then falls
    /// back to parsing the `Display` form. The string fallback keeps signals
    /// decodable after they crossed a serialization boundary (e.g. the
    /// sandbox bridge) where only the message survives.
    pub fn decode(err: &anyhow::Error) -> Option<ControlSignal> {
        if let Some(signal) = err.downcast_ref::<ControlSignal>() {
            return Some(signal.clone());
        }
        for cause in err.chain() {
            if let Some(signal) = Self::parse(&cause.to_string()) {
                return Some(signal);
            }
        }
        None
    }

    /// Parse a control signal from its `Display` form. Returns `None` for
    /// ordinary error messages.
    pub fn parse(message: &str) -> Option<ControlSignal> {
        let message = message.trim();
        if let Some(approval_id) = message.strip_prefix("approval_pending:") {
            if !approval_id.is_empty() {
                return Some(ControlSignal::ApprovalPending {
                    approval_id: approval_id.to_string(),
                    retry_after_ms: None,
                });
            }
        }
        if let Some(reason) = message.strip_prefix("approval_denied:") {
            return Some(ControlSignal::ApprovalDenied {
                reason: reason.to_string(),
            });
        }
        if message == "TASK_TIMEOUT" {
            return Some(ControlSignal::TaskTimeout);
        }
        None
    }
}
