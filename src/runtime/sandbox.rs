use super::{RunOutcome, RunSpec, RunStatus, Runtime};
use crate::runtime::adapter::{ExecutionAdapter, OutputStream};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Stdout line prefix carrying the final outcome from the runner script.
pub const RESULT_MARKER: &str = "__EXECUTOR_RESULT__";

/// Grace on top of the task timeout before the process is killed: covers
/// sandbox startup and result flushing.
const KILL_GRACE: Duration = Duration::from_secs(30);

/// How many trailing output lines are kept for failure messages.
const TAIL_LINES: usize = 20;

/// Runs code in a separate runner process speaking the sandbox bridge
/// protocol. The runner receives the code on stdin plus the bridge
/// coordinates in its environment, streams stdout/stderr back through the
/// adapter, and reports its outcome as a `__EXECUTOR_RESULT__{...}` line.
pub struct SandboxRuntime {
    id: String,
    label: String,
    command: Vec<String>,
    bridge_base_url: String,
    internal_token: String,
}

impl SandboxRuntime {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        command: Vec<String>,
        bridge_base_url: impl Into<String>,
        internal_token: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            command,
            bridge_base_url: bridge_base_url.into(),
            internal_token: internal_token.into(),
        }
    }
}

#[async_trait]
impl Runtime for SandboxRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn run(&self, spec: RunSpec, adapter: Arc<dyn ExecutionAdapter>) -> Result<RunOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .context("sandbox runtime has an empty command")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("EXECUTOR_RUN_ID", &spec.task_id)
            .env("EXECUTOR_INTERNAL_TOKEN", &self.internal_token)
            .env("EXECUTOR_BRIDGE_URL", &self.bridge_base_url)
            .env("EXECUTOR_TIMEOUT_MS", spec.timeout_ms.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn sandbox runner '{}'", program))?;

        // The user code travels over stdin; no temp files to clean up.
        let mut stdin = child.stdin.take().context("runner stdin unavailable")?;
        stdin
            .write_all(spec.code.as_bytes())
            .await
            .context("failed to write code to the runner")?;
        drop(stdin);

        let stdout = child.stdout.take().context("runner stdout unavailable")?;
        let stderr = child.stderr.take().context("runner stderr unavailable")?;

        let deadline = Duration::from_millis(spec.timeout_ms) + KILL_GRACE;
        let outcome = tokio::time::timeout(
            deadline,
            drive_runner(&spec.task_id, stdout, stderr, adapter),
        )
        .await;

        match outcome {
            Ok(result) => {
                // Let the process finish; it already reported.
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                result
            }
            Err(_) => {
                warn!(
                    "sandbox run {} exceeded {}ms + grace; killing runner",
                    spec.task_id, spec.timeout_ms
                );
                let _ = child.kill().await;
                Ok(RunOutcome {
                    status: RunStatus::TimedOut,
                    result: None,
                    exit_code: None,
                    error: Some("TASK_TIMEOUT".to_string()),
                })
            }
        }
    }
}

async fn drive_runner(
    task_id: &str,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    adapter: Arc<dyn ExecutionAdapter>,
) -> Result<RunOutcome> {
    // Stderr streams independently so a chatty runner cannot deadlock the
    // stdout reader.
    let stderr_adapter = adapter.clone();
    let stderr_task = tokio::spawn(async move {
        let mut tail: Vec<String> = Vec::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stderr_adapter.emit_output(OutputStream::Stderr, &line).await;
            if tail.len() >= TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line);
        }
        tail
    });

    let mut marker: Option<Value> = None;
    let mut stdout_tail: Vec<String> = Vec::new();
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(payload) = line.strip_prefix(RESULT_MARKER) {
            match serde_json::from_str::<Value>(payload) {
                Ok(value) => marker = Some(value),
                Err(e) => warn!("run {}: unparseable result marker: {}", task_id, e),
            }
            continue;
        }
        adapter.emit_output(OutputStream::Stdout, &line).await;
        if stdout_tail.len() >= TAIL_LINES {
            stdout_tail.remove(0);
        }
        stdout_tail.push(line);
    }
    let stderr_tail = stderr_task.await.unwrap_or_default();

    let Some(marker) = marker else {
        // The runner died or exited without reporting; surface its tail.
        let mut detail = stdout_tail;
        detail.extend(stderr_tail);
        let tail = detail.join("\n");
        return Ok(RunOutcome::failed(format!(
            "sandbox exited without a result marker{}{}",
            if tail.is_empty() { "" } else { ": " },
            tail
        )));
    };

    debug!("run {} reported a result marker", task_id);
    let status = match marker.get("status").and_then(Value::as_str) {
        Some("completed") => RunStatus::Completed,
        Some("timed_out") => RunStatus::TimedOut,
        Some("denied") => RunStatus::Denied,
        _ => RunStatus::Failed,
    };
    Ok(RunOutcome {
        status,
        result: marker.get("result").cloned().filter(|v| !v.is_null()),
        exit_code: marker.get("exitCode").and_then(Value::as_i64),
        error: marker
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
