use super::adapter::{
    ExecutionAdapter, OutputStream, ToolCallOutcome, outcome_from_result,
};
use super::sandbox::SandboxRuntime;
use super::*;
use crate::errors::ControlSignal;
use crate::invoke::ToolCallRequest;
use std::sync::Mutex;

/// Adapter double that records emitted output and refuses tool calls.
struct RecordingAdapter {
    lines: Mutex<Vec<(OutputStream, String)>>,
}

impl RecordingAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl ExecutionAdapter for RecordingAdapter {
    async fn invoke_tool(&self, _request: ToolCallRequest) -> ToolCallOutcome {
        ToolCallOutcome::Failed {
            error: "no tools in this test".to_string(),
        }
    }

    async fn emit_output(&self, stream: OutputStream, line: &str) {
        self.lines.lock().unwrap().push((stream, line.to_string()));
    }
}

#[test]
fn test_eval_arithmetic() {
    assert_eq!(eval_arithmetic("40 + 2"), Some(42));
    assert_eq!(eval_arithmetic("2 * (3 + 4)"), Some(14));
    assert_eq!(eval_arithmetic("10 / 2 - 1"), Some(4));
    assert_eq!(eval_arithmetic("-5 + 3"), Some(-2));
    assert_eq!(eval_arithmetic("1 / 0"), None);
    assert_eq!(eval_arithmetic("forty + two"), None);
    assert_eq!(eval_arithmetic("(1"), None);
}

#[tokio::test]
async fn test_local_echo_runtime_arithmetic_return() {
    let runtime = LocalEchoRuntime;
    let outcome = runtime
        .run(
            RunSpec {
                task_id: "t".to_string(),
                code: "return 40 + 2".to_string(),
                timeout_ms: 1000,
            },
            RecordingAdapter::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.result, Some(serde_json::json!(42)));
    assert_eq!(outcome.exit_code, Some(0));
}

#[tokio::test]
async fn test_local_echo_runtime_json_literal_and_no_return() {
    let runtime = LocalEchoRuntime;
    let outcome = runtime
        .run(
            RunSpec {
                task_id: "t".to_string(),
                code: "const x = 1;\nreturn {\"ok\": true};".to_string(),
                timeout_ms: 1000,
            },
            RecordingAdapter::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.result, Some(serde_json::json!({"ok": true})));

    let outcome = runtime
        .run(
            RunSpec {
                task_id: "t".to_string(),
                code: "console.log('hi')".to_string(),
                timeout_ms: 1000,
            },
            RecordingAdapter::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.result, None);
}

#[test]
fn test_outcome_wire_roundtrip() {
    let cases = vec![
        ToolCallOutcome::Ok {
            value: serde_json::json!({"n": 1}),
        },
        ToolCallOutcome::Pending {
            approval_id: "apr-1".to_string(),
            retry_after_ms: Some(750),
        },
        ToolCallOutcome::Denied {
            error: "denied".to_string(),
        },
        ToolCallOutcome::Failed {
            error: "boom".to_string(),
        },
    ];
    for outcome in cases {
        let wire = outcome.to_value();
        let parsed = ToolCallOutcome::from_value(&wire).unwrap();
        assert_eq!(parsed, outcome);
    }

    // Wire shape of the pending case.
    let wire = ToolCallOutcome::Pending {
        approval_id: "apr-1".to_string(),
        retry_after_ms: None,
    }
    .to_value();
    assert_eq!(wire["ok"], false);
    assert_eq!(wire["kind"], "pending");
    assert_eq!(wire["approvalId"], "apr-1");
    assert!(wire.get("retryAfterMs").is_none());
}

#[test]
fn test_outcome_from_result_decodes_signals() {
    let pending = outcome_from_result(Err(ControlSignal::ApprovalPending {
        approval_id: "apr-9".to_string(),
        retry_after_ms: None,
    }
    .into()));
    match pending {
        ToolCallOutcome::Pending {
            approval_id,
            retry_after_ms,
        } => {
            assert_eq!(approval_id, "apr-9");
            assert!(retry_after_ms.is_some());
        }
        other => panic!("expected pending, got {:?}", other),
    }

    let denied = outcome_from_result(Err(ControlSignal::ApprovalDenied {
        reason: "nope".to_string(),
    }
    .into()));
    assert_eq!(
        denied,
        ToolCallOutcome::Denied {
            error: "nope".to_string()
        }
    );

    let failed = outcome_from_result(Err(anyhow::anyhow!("plain failure")));
    assert!(matches!(failed, ToolCallOutcome::Failed { .. }));

    let ok = outcome_from_result(Ok(serde_json::json!(5)));
    assert_eq!(
        ok,
        ToolCallOutcome::Ok {
            value: serde_json::json!(5)
        }
    );
}

#[tokio::test]
async fn test_runtime_registry_targets_sorted() {
    let mut registry = RuntimeRegistry::new();
    registry.register(Arc::new(LocalEchoRuntime));
    registry.register(Arc::new(SandboxRuntime::new(
        "node-sandbox",
        "Node.js sandbox",
        vec!["node".to_string(), "runner.mjs".to_string()],
        "http://127.0.0.1:3011",
        "token",
    )));

    let targets = registry.targets();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].0, "local");
    assert_eq!(targets[1].0, "node-sandbox");
    assert!(registry.get("local").is_some());
    assert!(registry.get("missing").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_sandbox_runtime_parses_result_marker() {
    let runtime = SandboxRuntime::new(
        "test-sandbox",
        "test",
        vec![
            "sh".to_string(),
            "-c".to_string(),
            concat!(
                "cat > /dev/null; ",
                "echo 'working...'; ",
                "echo 'warning' >&2; ",
                "echo '__EXECUTOR_RESULT__{\"status\":\"completed\",\"result\":7,\"exitCode\":0,\"durationMs\":12}'"
            )
            .to_string(),
        ],
        "http://127.0.0.1:0",
        "token",
    );

    let adapter = RecordingAdapter::new();
    let outcome = runtime
        .run(
            RunSpec {
                task_id: "t1".to_string(),
                code: "return 7".to_string(),
                timeout_ms: 5000,
            },
            adapter.clone(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.result, Some(serde_json::json!(7)));
    assert_eq!(outcome.exit_code, Some(0));

    let lines = adapter.lines.lock().unwrap();
    assert!(
        lines
            .iter()
            .any(|(s, l)| *s == OutputStream::Stdout && l == "working...")
    );
    assert!(
        lines
            .iter()
            .any(|(s, l)| *s == OutputStream::Stderr && l == "warning")
    );
    // The marker line itself is not forwarded as output.
    assert!(lines.iter().all(|(_, l)| !l.contains("__EXECUTOR_RESULT__")));
}

#[cfg(unix)]
#[tokio::test]
async fn test_sandbox_runtime_without_marker_fails_with_tail() {
    let runtime = SandboxRuntime::new(
        "test-sandbox",
        "test",
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; echo 'something broke'; exit 3".to_string(),
        ],
        "http://127.0.0.1:0",
        "token",
    );

    let outcome = runtime
        .run(
            RunSpec {
                task_id: "t1".to_string(),
                code: String::new(),
                timeout_ms: 5000,
            },
            RecordingAdapter::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    let error = outcome.error.unwrap();
    assert!(error.contains("without a result marker"));
    assert!(error.contains("something broke"));
}
