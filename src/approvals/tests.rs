use super::*;
use crate::hub::EventHub;
use crate::store::NewTask;
use std::collections::HashMap;

fn setup() -> (Arc<Repository>, ApprovalCoordinator, String) {
    let repo = Arc::new(Repository::open_ephemeral(Arc::new(EventHub::new())).unwrap());
    let task = repo
        .create_task(NewTask {
            workspace_id: "ws".to_string(),
            account_id: "acct".to_string(),
            code: String::new(),
            runtime_id: "local".to_string(),
            timeout_ms: 30_000,
            metadata: HashMap::new(),
        })
        .unwrap();
    let coordinator = ApprovalCoordinator::new(repo.clone());
    (repo, coordinator, task.id)
}

#[tokio::test]
async fn test_resolve_publishes_event_with_decision() {
    let (repo, coordinator, task_id) = setup();
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();

    let resolved = coordinator
        .resolve(
            "ws",
            &approval.id,
            ApprovalStatus::Denied,
            Some("reviewer-1"),
            Some("too dangerous"),
        )
        .unwrap()
        .unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Denied);

    let events = repo.list_events(&task_id, 0).unwrap();
    let event = events
        .iter()
        .find(|e| e.event_type == "approval.resolved")
        .unwrap();
    assert_eq!(event.payload["decision"], "denied");
    assert_eq!(event.payload["reviewerId"], "reviewer-1");
    assert_eq!(event.payload["reason"], "too dangerous");
    assert_eq!(event.payload["pendingApprovalCount"], 0);
}

#[tokio::test]
async fn test_resolve_non_pending_returns_none() {
    let (_, coordinator, task_id) = setup();
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();
    coordinator
        .resolve("ws", &approval.id, ApprovalStatus::Approved, None, None)
        .unwrap()
        .unwrap();

    assert!(
        coordinator
            .resolve("ws", &approval.id, ApprovalStatus::Denied, None, None)
            .unwrap()
            .is_none()
    );
    assert!(
        coordinator
            .resolve("ws", "apr_nonexistent", ApprovalStatus::Approved, None, None)
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_resolve_rejects_pending_decision() {
    let (_, coordinator, task_id) = setup();
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();
    assert!(
        coordinator
            .resolve("ws", &approval.id, ApprovalStatus::Pending, None, None)
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn test_wait_polling_sees_approval() {
    let (_, coordinator, task_id) = setup();
    let coordinator = Arc::new(coordinator);
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();

    let waiter = {
        let coordinator = coordinator.clone();
        let approval_id = approval.id.clone();
        tokio::spawn(async move {
            coordinator
                .wait_polling(&approval_id, Duration::from_secs(60))
                .await
        })
    };

    // Let a few poll cycles pass before resolving.
    tokio::time::sleep(Duration::from_secs(2)).await;
    coordinator
        .resolve("ws", &approval.id, ApprovalStatus::Approved, None, None)
        .unwrap()
        .unwrap();

    let resolved = waiter.await.unwrap().unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);
}

#[tokio::test(start_paused = true)]
async fn test_wait_polling_times_out() {
    let (_, coordinator, task_id) = setup();
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();
    let err = coordinator
        .wait_polling(&approval.id, Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_wait_subscribed_resumes_on_resolution() {
    let (_, coordinator, task_id) = setup();
    let coordinator = Arc::new(coordinator);
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();

    let waiter = {
        let coordinator = coordinator.clone();
        let approval_id = approval.id.clone();
        tokio::spawn(async move {
            coordinator
                .wait_subscribed(&approval_id, Duration::from_secs(30))
                .await
        })
    };
    // Give the waiter a moment to subscribe.
    tokio::time::sleep(Duration::from_millis(50)).await;

    coordinator
        .resolve("ws", &approval.id, ApprovalStatus::Approved, None, None)
        .unwrap()
        .unwrap();
    let resolved = waiter.await.unwrap().unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_wait_subscribed_denial_is_failure_signal() {
    let (_, coordinator, task_id) = setup();
    let coordinator = Arc::new(coordinator);
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();

    let waiter = {
        let coordinator = coordinator.clone();
        let approval_id = approval.id.clone();
        tokio::spawn(async move {
            coordinator
                .wait_subscribed(&approval_id, Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    coordinator
        .resolve(
            "ws",
            &approval.id,
            ApprovalStatus::Denied,
            None,
            Some("nope"),
        )
        .unwrap()
        .unwrap();
    let err = waiter.await.unwrap().unwrap_err();
    match crate::errors::ControlSignal::decode(&err).unwrap() {
        ControlSignal::ApprovalDenied { reason } => assert_eq!(reason, "nope"),
        other => panic!("expected denial, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wait_subscribed_already_resolved_returns_immediately() {
    let (_, coordinator, task_id) = setup();
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();
    coordinator
        .resolve("ws", &approval.id, ApprovalStatus::Approved, None, None)
        .unwrap()
        .unwrap();

    let resolved = coordinator
        .wait_subscribed(&approval.id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_wait_subscribed_terminal_task_aborts_wait() {
    let (repo, coordinator, task_id) = setup();
    let coordinator = Arc::new(coordinator);
    let approval = coordinator
        .create(&task_id, "admin.send", serde_json::json!({}))
        .unwrap();

    let waiter = {
        let coordinator = coordinator.clone();
        let approval_id = approval.id.clone();
        tokio::spawn(async move {
            coordinator
                .wait_subscribed(&approval_id, Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    repo.append_event(
        &task_id,
        crate::store::types::EventFamily::Task,
        "task.failed",
        serde_json::json!({"status": "failed"}),
    )
    .unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("ended while approval"));
}
