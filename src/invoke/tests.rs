use super::*;
use crate::hub::EventHub;
use crate::store::NewTask;
use crate::store::types::{AccessPolicy, MatchType, PolicyEffect, PolicyScope, ResourceType};
use std::collections::HashMap;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    repo: Arc<Repository>,
    registry: Arc<ToolRegistry>,
    pipeline: InvocationPipeline,
    task: Task,
}

async fn fixture(base_url: &str) -> Fixture {
    let repo = Arc::new(Repository::open_ephemeral(Arc::new(EventHub::new())).unwrap());
    let executor = ToolExecutor::new();
    let registry = Arc::new(ToolRegistry::new(repo.clone(), executor.clone()));

    repo.upsert_tool_source(
        "ws",
        None,
        crate::store::types::SourceKind::Openapi,
        "admin",
        &serde_json::json!({
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
                    "/users": {
                        "get": {"operationId": "list_users", "tags": ["admin"]}
                    },
                    "/secure": {
                        "get": {"operationId": "secure_read", "tags": ["admin"]}
                    }
                }
            }
        }),
        true,
    )
    .unwrap();

    let task = repo
        .create_task(NewTask {
            workspace_id: "ws".to_string(),
            account_id: "acct-1".to_string(),
            code: String::new(),
            runtime_id: "local".to_string(),
            timeout_ms: 30_000,
            metadata: HashMap::new(),
        })
        .unwrap();

    Fixture {
        repo: repo.clone(),
        registry: registry.clone(),
        pipeline: InvocationPipeline::new(repo, registry, executor),
        task,
    }
}

fn request(task_id: &str, call_id: &str, tool_path: &str, input: Value) -> ToolCallRequest {
    ToolCallRequest {
        run_id: task_id.to_string(),
        call_id: call_id.to_string(),
        tool_path: tool_path.to_string(),
        input,
    }
}

fn event_types(repo: &Repository, task_id: &str) -> Vec<String> {
    repo.list_events(task_id, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn test_unknown_tool_fails_with_suggestions() {
    let f = fixture("http://localhost:1").await;
    let err = f
        .pipeline
        .invoke(&request(&f.task.id, "c1", "admin.admin.missing_tool", serde_json::json!({})))
        .await
        .unwrap_err();

    let message = format!("{:#}", err);
    assert!(message.contains("Unknown tool: admin.admin.missing_tool"));
    assert!(message.contains("discover("));
    // Not a control signal: the runtime treats this as a plain failure.
    assert!(ControlSignal::decode(&err).is_none());

    let call = f.repo.get_tool_call(&f.task.id, "c1").unwrap().unwrap();
    assert_eq!(call.status, ToolCallStatus::Failed);
}

#[tokio::test]
async fn test_policy_deny_fails_fast_without_approval_row() {
    let f = fixture("http://localhost:1").await;
    f.repo
        .upsert_policy(&AccessPolicy {
            id: "deny-1".to_string(),
            workspace_id: "ws".to_string(),
            scope: PolicyScope::Workspace,
            organization_id: None,
            target_account_id: None,
            client_id: None,
            resource_type: ResourceType::ToolPath,
            pattern: "admin.admin.send_announcement".to_string(),
            match_type: MatchType::Exact,
            effect: PolicyEffect::Deny,
            approval_mode: ApprovalMode::Inherit,
            argument_conditions: vec![],
            priority: 500,
            created_order: 0,
        })
        .unwrap();

    let err = f
        .pipeline
        .invoke(&request(
            &f.task.id,
            "c1",
            "admin.admin.send_announcement",
            serde_json::json!({"channel": "general"}),
        ))
        .await
        .unwrap_err();

    match ControlSignal::decode(&err).unwrap() {
        ControlSignal::ApprovalDenied { reason } => {
            assert!(reason.contains("admin.admin.send_announcement"));
            assert!(reason.contains("policy_deny"));
        }
        other => panic!("expected denial, got {:?}", other),
    }

    // No approval row was created.
    assert!(f.repo.list_approvals("ws", None).unwrap().is_empty());

    let call = f.repo.get_tool_call(&f.task.id, "c1").unwrap().unwrap();
    assert_eq!(call.status, ToolCallStatus::Denied);

    let events = f.repo.list_events(&f.task.id, 0).unwrap();
    let denied = events
        .iter()
        .find(|e| e.event_type == "tool.call.denied")
        .unwrap();
    assert_eq!(denied.payload["reason"], "policy_deny");
}

#[tokio::test]
async fn test_approval_gate_approved_resumes_and_replays() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/announce"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"delivered": "hi"})),
        )
        .expect(1) // the tool body runs exactly once
        .mount(&server)
        .await;

    let f = fixture(&server.uri()).await;
    let req = request(
        &f.task.id,
        "c1",
        "admin.admin.send_announcement",
        serde_json::json!({"channel": "general", "message": "hi"}),
    );

    // First attempt suspends: write method defaults to approval required.
    let err = f.pipeline.invoke(&req).await.unwrap_err();
    let approval_id = match ControlSignal::decode(&err).unwrap() {
        ControlSignal::ApprovalPending { approval_id, .. } => approval_id,
        other => panic!("expected suspension, got {:?}", other),
    };
    let call = f.repo.get_tool_call(&f.task.id, "c1").unwrap().unwrap();
    assert_eq!(call.status, ToolCallStatus::PendingApproval);
    assert!(event_types(&f.repo, &f.task.id).contains(&"approval.requested".to_string()));

    // A second attempt while pending suspends again with the same approval.
    let err = f.pipeline.invoke(&req).await.unwrap_err();
    match ControlSignal::decode(&err).unwrap() {
        ControlSignal::ApprovalPending { approval_id: again, .. } => {
            assert_eq!(again, approval_id);
        }
        other => panic!("expected suspension, got {:?}", other),
    }
    assert_eq!(f.repo.list_approvals("ws", None).unwrap().len(), 1);

    // Approve and re-invoke: the tool executes.
    f.repo
        .resolve_approval("ws", &approval_id, ApprovalStatus::Approved, None, None)
        .unwrap()
        .unwrap();
    let output = f.pipeline.invoke(&req).await.unwrap();
    assert_eq!(output["delivered"], "hi");

    let events = event_types(&f.repo, &f.task.id);
    assert!(events.contains(&"tool.call.completed".to_string()));
    // started fired once, on the first attempt only.
    assert_eq!(events.iter().filter(|e| *e == "tool.call.started").count(), 1);

    // Replay: same call id returns the cached output; the mock's expect(1)
    // verifies the body did not run again.
    let replayed = f.pipeline.invoke(&req).await.unwrap();
    assert_eq!(replayed, output);
    assert_eq!(f.repo.list_approvals("ws", None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_approval_denied_terminates_with_reason() {
    let f = fixture("http://localhost:1").await;
    let req = request(
        &f.task.id,
        "c1",
        "admin.admin.send_announcement",
        serde_json::json!({"channel": "general", "message": "hi"}),
    );

    let err = f.pipeline.invoke(&req).await.unwrap_err();
    let approval_id = match ControlSignal::decode(&err).unwrap() {
        ControlSignal::ApprovalPending { approval_id, .. } => approval_id,
        other => panic!("expected suspension, got {:?}", other),
    };

    f.repo
        .resolve_approval(
            "ws",
            &approval_id,
            ApprovalStatus::Denied,
            Some("reviewer-1"),
            Some("too dangerous"),
        )
        .unwrap()
        .unwrap();

    let err = f.pipeline.invoke(&req).await.unwrap_err();
    match ControlSignal::decode(&err).unwrap() {
        ControlSignal::ApprovalDenied { reason } => {
            assert!(reason.contains("too dangerous"));
            assert!(reason.contains("admin.admin.send_announcement"));
        }
        other => panic!("expected denial, got {:?}", other),
    }
    let call = f.repo.get_tool_call(&f.task.id, "c1").unwrap().unwrap();
    assert_eq!(call.status, ToolCallStatus::Denied);

    // Replays of the denied call keep returning the denial without work.
    let err = f.pipeline.invoke(&req).await.unwrap_err();
    assert!(matches!(
        ControlSignal::decode(&err),
        Some(ControlSignal::ApprovalDenied { .. })
    ));
}

#[tokio::test]
async fn test_auto_allowed_tool_executes_directly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(["alice"])))
        .mount(&server)
        .await;

    let f = fixture(&server.uri()).await;
    let output = f
        .pipeline
        .invoke(&request(&f.task.id, "c1", "admin.admin.list_users", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(output, serde_json::json!(["alice"]));

    // Completed events redact output.
    let events = f.repo.list_events(&f.task.id, 0).unwrap();
    let completed = events
        .iter()
        .find(|e| e.event_type == "tool.call.completed")
        .unwrap();
    assert_eq!(completed.payload["outputRedacted"], true);
    assert!(completed.payload.get("output").is_none());
}

#[tokio::test]
async fn test_failed_call_is_journaled_and_replayed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(&server.uri()).await;
    let req = request(&f.task.id, "c1", "admin.admin.list_users", serde_json::json!({}));

    let err = f.pipeline.invoke(&req).await.unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("admin.admin.list_users"));
    assert!(message.contains("500"));

    // Replay sees the cached failure; the mock is not hit again.
    let err = f.pipeline.invoke(&req).await.unwrap_err();
    assert!(format!("{:#}", err).contains("500"));
    assert!(event_types(&f.repo, &f.task.id).contains(&"tool.call.failed".to_string()));
}

#[tokio::test]
async fn test_missing_credential_fails_call() {
    let repo = Arc::new(Repository::open_ephemeral(Arc::new(EventHub::new())).unwrap());
    let executor = ToolExecutor::new();
    let registry = Arc::new(ToolRegistry::new(repo.clone(), executor.clone()));
    repo.upsert_tool_source(
        "ws",
        None,
        crate::store::types::SourceKind::Openapi,
        "secure",
        &serde_json::json!({
            "baseUrl": "http://localhost:1",
            "requiresCredential": true,
            "spec": {"openapi": "3.0.0", "paths": {
                "/data": {"get": {"operationId": "read_data", "tags": ["vault"]}}
            }}
        }),
        true,
    )
    .unwrap();
    let task = repo
        .create_task(NewTask {
            workspace_id: "ws".to_string(),
            account_id: "acct-1".to_string(),
            code: String::new(),
            runtime_id: "local".to_string(),
            timeout_ms: 30_000,
            metadata: HashMap::new(),
        })
        .unwrap();
    let pipeline = InvocationPipeline::new(repo.clone(), registry, executor);

    let err = pipeline
        .invoke(&request(&task.id, "c1", "secure.vault.read_data", serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("no credential found for source openapi:secure"));
    let call = repo.get_tool_call(&task.id, "c1").unwrap().unwrap();
    assert_eq!(call.status, ToolCallStatus::Failed);
}

#[tokio::test]
async fn test_discover_system_tool_runs_in_process() {
    let f = fixture("http://localhost:1").await;
    f.registry.rebuild("ws").await.unwrap();

    let output = f
        .pipeline
        .invoke(&request(
            &f.task.id,
            "c1",
            "discover",
            serde_json::json!({"query": "announcement"}),
        ))
        .await
        .unwrap();

    let tools = output["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["canonicalPath"], "admin.admin.send_announcement");
}

#[tokio::test]
async fn test_discover_without_ready_registry_fails_without_scanning() {
    // No build has run; the fast path must surface the not-ready error
    // instead of kicking off source loaders.
    let f = fixture("http://localhost:1").await;
    let err = f
        .pipeline
        .invoke(&request(&f.task.id, "c1", "discover", serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("registry not ready"));

    let call = f.repo.get_tool_call(&f.task.id, "c1").unwrap().unwrap();
    assert_eq!(call.status, ToolCallStatus::Failed);
    // Nothing was compiled behind the caller's back.
    assert!(f.repo.list_registry_build_ids("ws").unwrap().is_empty());
}

#[tokio::test]
async fn test_catalog_and_storage_system_tools() {
    let f = fixture("http://localhost:1").await;
    f.registry.rebuild("ws").await.unwrap();

    let namespaces = f
        .pipeline
        .invoke(&request(&f.task.id, "c1", "catalog.namespaces", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(namespaces["namespaces"][0]["namespace"], "admin");

    f.pipeline
        .invoke(&request(
            &f.task.id,
            "c2",
            "storage.put",
            serde_json::json!({"key": "notes", "value": {"pinned": true}}),
        ))
        .await
        .unwrap();
    let got = f
        .pipeline
        .invoke(&request(
            &f.task.id,
            "c3",
            "storage.get",
            serde_json::json!({"key": "notes"}),
        ))
        .await
        .unwrap();
    assert_eq!(got["pinned"], true);
}

#[tokio::test]
async fn test_graphql_executor_policy_uses_effective_paths() {
    // A deny on one mutation field blocks the whole document.
    let repo = Arc::new(Repository::open_ephemeral(Arc::new(EventHub::new())).unwrap());
    let executor = ToolExecutor::new();
    let registry = Arc::new(ToolRegistry::new(repo.clone(), executor.clone()));

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"__schema": {
                "queryType": {"name": "Query", "fields": [{"name": "viewer"}]},
                "mutationType": {"name": "Mutation", "fields": [{"name": "deleteRepo"}]}
            }}
        })))
        .mount(&server)
        .await;

    repo.upsert_tool_source(
        "ws",
        None,
        crate::store::types::SourceKind::Graphql,
        "gh",
        &serde_json::json!({"url": format!("{}/graphql", server.uri())}),
        true,
    )
    .unwrap();
    repo.upsert_policy(&AccessPolicy {
        id: "deny-delete".to_string(),
        workspace_id: "ws".to_string(),
        scope: PolicyScope::Workspace,
        organization_id: None,
        target_account_id: None,
        client_id: None,
        resource_type: ResourceType::ToolPath,
        pattern: "gh.mutation.deleterepo".to_string(),
        match_type: MatchType::Exact,
        effect: PolicyEffect::Deny,
        approval_mode: ApprovalMode::Inherit,
        argument_conditions: vec![],
        priority: 0,
        created_order: 0,
    })
    .unwrap();

    let task = repo
        .create_task(NewTask {
            workspace_id: "ws".to_string(),
            account_id: "acct-1".to_string(),
            code: String::new(),
            runtime_id: "local".to_string(),
            timeout_ms: 30_000,
            metadata: HashMap::new(),
        })
        .unwrap();
    let pipeline = InvocationPipeline::new(repo.clone(), registry, executor);

    let err = pipeline
        .invoke(&request(
            &task.id,
            "c1",
            "gh.graphql",
            serde_json::json!({"query": "mutation { deleteRepo(id: \"r1\") { ok } }"}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        ControlSignal::decode(&err),
        Some(ControlSignal::ApprovalDenied { .. })
    ));

    // The denial event names the effective field paths.
    let events = repo.list_events(&task.id, 0).unwrap();
    let denied = events
        .iter()
        .find(|e| e.event_type == "tool.call.denied")
        .unwrap();
    assert_eq!(
        denied.payload["effectivePaths"],
        serde_json::json!(["gh.mutation.deleterepo"])
    );
}
