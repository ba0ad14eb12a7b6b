//! End-to-end lifecycle scenarios: queue a task, drive a runtime that calls
//! tools through the execution adapter, and observe terminal states, events,
//! and approval behavior.

use async_trait::async_trait;
use codeplane::ControlSignal;
use codeplane::approvals::ApprovalCoordinator;
use codeplane::hub::EventHub;
use codeplane::invoke::{InvocationPipeline, ToolCallRequest};
use codeplane::registry::ToolRegistry;
use codeplane::runtime::adapter::{ExecutionAdapter, ToolCallOutcome};
use codeplane::runtime::{
    LocalEchoRuntime, RunOutcome, RunSpec, Runtime, RuntimeRegistry,
};
use codeplane::scheduler::TaskScheduler;
use codeplane::sources::ToolExecutor;
use codeplane::store::types::{ApprovalStatus, SourceKind, TaskStatus};
use codeplane::store::{NewTask, Repository};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Stack {
    repo: Arc<Repository>,
    pipeline: Arc<InvocationPipeline>,
    coordinator: ApprovalCoordinator,
}

fn stack() -> Stack {
    let repo = Arc::new(Repository::open_ephemeral(Arc::new(EventHub::new())).unwrap());
    let executor = ToolExecutor::new();
    let registry = Arc::new(ToolRegistry::new(repo.clone(), executor.clone()));
    let pipeline = Arc::new(InvocationPipeline::new(
        repo.clone(),
        registry,
        executor,
    ));
    let coordinator = ApprovalCoordinator::new(repo.clone());
    Stack {
        repo,
        pipeline,
        coordinator,
    }
}

fn seed_admin_source(repo: &Repository, base_url: &str) {
    repo.upsert_tool_source(
        "ws",
        None,
        SourceKind::Openapi,
        "admin",
        &json!({
            "baseUrl": base_url,
            "spec": {
                "openapi": "3.0.0",
                "paths": {
                    "/announce": {
                        "post": {
                            "operationId": "send_announcement",
                            "tags": ["admin"],
                            "requestBody": {"content": {"application/json": {"schema": {
                                "type": "object",
                                "properties": {
                                    "channel": {"type": "string"},
                                    "message": {"type": "string"},
                                },
                            }}}}
                        }
                    },
                    "/wipe": {
                        "post": {
                            "operationId": "delete_data",
                            "tags": ["admin"],
                        }
                    }
                }
            }
        }),
        true,
    )
    .unwrap();
}

fn queue_task(repo: &Repository, runtime_id: &str) -> String {
    repo.create_task(NewTask {
        workspace_id: "ws".to_string(),
        account_id: "acct-1".to_string(),
        code: "await tools.admin.sendAnnouncement(...)".to_string(),
        runtime_id: runtime_id.to_string(),
        timeout_ms: 10_000,
        metadata: HashMap::new(),
    })
    .unwrap()
    .id
}

fn scheduler_for(stack: &Stack, runtimes: RuntimeRegistry) -> Arc<TaskScheduler> {
    TaskScheduler::new(
        stack.repo.clone(),
        stack.pipeline.clone(),
        Arc::new(runtimes),
        Duration::from_millis(25),
        4,
    )
}

async fn wait_terminal(repo: &Repository, task_id: &str) -> codeplane::store::types::Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = repo.get_task(task_id).unwrap().unwrap();
        if task.status.is_terminal() {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} stuck in {:?}",
            task_id,
            task.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Runtime double that makes exactly one tool call through the adapter and
/// keeps retrying while the call is pending approval, the way a sandbox
/// runner polls the bridge.
struct OneToolRuntime {
    tool_path: String,
    input: Value,
}

#[async_trait]
impl Runtime for OneToolRuntime {
    fn id(&self) -> &str {
        "one-tool"
    }

    fn label(&self) -> &str {
        "single tool call runtime"
    }

    async fn run(
        &self,
        spec: RunSpec,
        adapter: Arc<dyn ExecutionAdapter>,
    ) -> anyhow::Result<RunOutcome> {
        let request = ToolCallRequest {
            run_id: spec.task_id.clone(),
            call_id: "call-1".to_string(),
            tool_path: self.tool_path.clone(),
            input: self.input.clone(),
        };
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(spec.timeout_ms);
        loop {
            match adapter.invoke_tool(request.clone()).await {
                ToolCallOutcome::Ok { value } => {
                    return Ok(RunOutcome::completed(Some(value)));
                }
                ToolCallOutcome::Pending { retry_after_ms, .. } => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ControlSignal::TaskTimeout.into());
                    }
                    tokio::time::sleep(Duration::from_millis(
                        retry_after_ms.unwrap_or(100).min(100),
                    ))
                    .await;
                }
                ToolCallOutcome::Denied { error } => {
                    return Err(ControlSignal::ApprovalDenied { reason: error }.into());
                }
                ToolCallOutcome::Failed { error } => {
                    return Ok(RunOutcome::failed(error));
                }
            }
        }
    }
}

#[tokio::test]
async fn test_auto_run_arithmetic_completes() {
    let stack = stack();
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(LocalEchoRuntime));
    let scheduler = scheduler_for(&stack, runtimes);
    let handle = scheduler.start();

    let task_id = stack
        .repo
        .create_task(NewTask {
            workspace_id: "ws".to_string(),
            account_id: "acct-1".to_string(),
            code: "return 40 + 2".to_string(),
            runtime_id: "local".to_string(),
            timeout_ms: 5_000,
            metadata: HashMap::new(),
        })
        .unwrap()
        .id;

    let task = wait_terminal(&stack.repo, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!(42)));
    assert_eq!(task.exit_code, Some(0));

    let events = stack.repo.list_events(&task_id, 0).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["task.running", "task.completed"]);
    let terminal = events.last().unwrap();
    assert_eq!(terminal.payload["status"], "completed");
    assert_eq!(terminal.payload["exitCode"], 0);

    // Event sequences are contiguous from 1.
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as i64 + 1);
    }

    scheduler.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_approval_gate_approved_runs_tool() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/announce"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"delivered": "hi", "channel": "general"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let stack = stack();
    seed_admin_source(&stack.repo, &server.uri());

    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(OneToolRuntime {
        tool_path: "admin.admin.send_announcement".to_string(),
        input: json!({"channel": "general", "message": "hi"}),
    }));
    let scheduler = scheduler_for(&stack, runtimes);
    let handle = scheduler.start();

    let task_id = queue_task(&stack.repo, "one-tool");

    // Wait for the approval request to appear, while the task stays running.
    let approval = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let pending = stack
                .repo
                .list_approvals("ws", Some(ApprovalStatus::Pending))
                .unwrap();
            if let Some(approval) = pending.into_iter().next() {
                break approval;
            }
            assert!(tokio::time::Instant::now() < deadline, "no approval requested");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    let running = stack.repo.get_task(&task_id).unwrap().unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    let call = stack.repo.get_tool_call(&task_id, "call-1").unwrap().unwrap();
    assert_eq!(
        call.status,
        codeplane::store::types::ToolCallStatus::PendingApproval
    );

    stack
        .coordinator
        .resolve("ws", &approval.id, ApprovalStatus::Approved, Some("rev-1"), None)
        .unwrap()
        .unwrap();

    let task = wait_terminal(&stack.repo, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.result.unwrap().to_string().contains("hi"));

    let types: Vec<String> = stack
        .repo
        .list_events(&task_id, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"approval.requested".to_string()));
    assert!(types.contains(&"approval.resolved".to_string()));
    assert!(types.contains(&"tool.call.completed".to_string()));

    scheduler.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_approval_gate_denied_terminates_task() {
    let stack = stack();
    seed_admin_source(&stack.repo, "http://localhost:1");

    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(OneToolRuntime {
        tool_path: "admin.admin.send_announcement".to_string(),
        input: json!({"channel": "general", "message": "hi"}),
    }));
    let scheduler = scheduler_for(&stack, runtimes);
    let handle = scheduler.start();

    let task_id = queue_task(&stack.repo, "one-tool");
    let approval = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let pending = stack
                .repo
                .list_approvals("ws", Some(ApprovalStatus::Pending))
                .unwrap();
            if let Some(approval) = pending.into_iter().next() {
                break approval;
            }
            assert!(tokio::time::Instant::now() < deadline, "no approval requested");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    stack
        .coordinator
        .resolve(
            "ws",
            &approval.id,
            ApprovalStatus::Denied,
            Some("rev-1"),
            Some("too dangerous"),
        )
        .unwrap()
        .unwrap();

    let task = wait_terminal(&stack.repo, &task_id).await;
    assert_eq!(task.status, TaskStatus::Denied);
    let error = task.error.unwrap();
    assert!(error.contains("admin.admin.send_announcement"));
    assert!(error.contains("too dangerous"));

    let events = stack.repo.list_events(&task_id, 0).unwrap();
    let resolved = events
        .iter()
        .find(|e| e.event_type == "approval.resolved")
        .unwrap();
    assert_eq!(resolved.payload["decision"], "denied");
    let call = stack.repo.get_tool_call(&task_id, "call-1").unwrap().unwrap();
    assert_eq!(call.status, codeplane::store::types::ToolCallStatus::Denied);

    scheduler.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_policy_deny_ends_task_denied_without_approval() {
    let stack = stack();
    seed_admin_source(&stack.repo, "http://localhost:1");
    stack
        .repo
        .upsert_policy(&codeplane::store::types::AccessPolicy {
            id: "deny-wipe".to_string(),
            workspace_id: "ws".to_string(),
            scope: codeplane::store::types::PolicyScope::Workspace,
            organization_id: None,
            target_account_id: None,
            client_id: None,
            resource_type: codeplane::store::types::ResourceType::ToolPath,
            pattern: "admin.admin.delete_data".to_string(),
            match_type: codeplane::store::types::MatchType::Exact,
            effect: codeplane::store::types::PolicyEffect::Deny,
            approval_mode: codeplane::store::types::ApprovalMode::Inherit,
            argument_conditions: vec![],
            priority: 500,
            created_order: 0,
        })
        .unwrap();

    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(OneToolRuntime {
        tool_path: "admin.admin.delete_data".to_string(),
        input: json!({}),
    }));
    let scheduler = scheduler_for(&stack, runtimes);
    let handle = scheduler.start();

    let task_id = queue_task(&stack.repo, "one-tool");
    let task = wait_terminal(&stack.repo, &task_id).await;
    assert_eq!(task.status, TaskStatus::Denied);

    // No approval row was ever created.
    assert!(stack.repo.list_approvals("ws", None).unwrap().is_empty());

    let events = stack.repo.list_events(&task_id, 0).unwrap();
    let denied = events
        .iter()
        .find(|e| e.event_type == "tool.call.denied")
        .unwrap();
    assert_eq!(denied.payload["reason"], "policy_deny");

    scheduler.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_unknown_tool_fails_task_with_suggestions() {
    let stack = stack();
    seed_admin_source(&stack.repo, "http://localhost:1");

    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(OneToolRuntime {
        tool_path: "admin.admin.missing_tool".to_string(),
        input: json!({}),
    }));
    let scheduler = scheduler_for(&stack, runtimes);
    let handle = scheduler.start();

    let task_id = queue_task(&stack.repo, "one-tool");
    let task = wait_terminal(&stack.repo, &task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert!(
        error.starts_with("Unknown tool: admin.admin.missing_tool"),
        "error: {}",
        error
    );
    assert!(error.contains("discover("));

    scheduler.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_terminal_tasks_accept_no_further_transitions() {
    let stack = stack();
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(LocalEchoRuntime));
    let scheduler = scheduler_for(&stack, runtimes);

    let task_id = stack
        .repo
        .create_task(NewTask {
            workspace_id: "ws".to_string(),
            account_id: "acct".to_string(),
            code: "return 1".to_string(),
            runtime_id: "local".to_string(),
            timeout_ms: 5_000,
            metadata: HashMap::new(),
        })
        .unwrap()
        .id;
    scheduler.drain_queue("test").await;

    let task = stack.repo.get_task(&task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // A late failure write is refused; status and events stay put.
    let events_before = stack.repo.list_events(&task_id, 0).unwrap().len();
    let refused = stack
        .repo
        .finish_task(&task_id, TaskStatus::Failed, None, Some("late"), None)
        .unwrap();
    assert!(refused.is_none());
    assert_eq!(
        stack.repo.get_task(&task_id).unwrap().unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(stack.repo.list_events(&task_id, 0).unwrap().len(), events_before);
}
