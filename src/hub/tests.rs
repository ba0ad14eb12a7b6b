use super::*;
use crate::store::types::EventFamily;
use chrono::Utc;

fn event(task_id: &str, seq: i64, event_type: &str) -> TaskEvent {
    TaskEvent {
        task_id: task_id.to_string(),
        seq,
        family: EventFamily::Task,
        event_type: event_type.to_string(),
        payload: serde_json::json!({}),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_events_delivered_in_publication_order() {
    let hub = EventHub::new();
    let mut rx = hub.subscribe("task-1");

    for seq in 1..=5 {
        hub.publish(&event("task-1", seq, "task.running"));
    }

    for expected in 1..=5 {
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.seq, expected);
    }
}

#[tokio::test]
async fn test_publish_without_listeners_is_noop() {
    let hub = EventHub::new();
    // No subscription ever made; publish must not panic or accumulate.
    hub.publish(&event("task-orphan", 1, "task.running"));
    assert_eq!(hub.channel_count(), 0);
}

#[tokio::test]
async fn test_listeners_isolated_per_task() {
    let hub = EventHub::new();
    let mut rx_a = hub.subscribe("task-a");
    let mut rx_b = hub.subscribe("task-b");

    hub.publish(&event("task-a", 1, "task.running"));
    hub.publish(&event("task-b", 1, "task.completed"));

    assert_eq!(rx_a.recv().await.unwrap().event_type, "task.running");
    assert_eq!(rx_b.recv().await.unwrap().event_type, "task.completed");
}

#[tokio::test]
async fn test_slow_listener_drops_without_blocking_publisher() {
    let hub = EventHub::new();
    let mut rx = hub.subscribe("task-1");

    // Overflow the per-listener buffer; publish must never block.
    let total = (LISTENER_BUFFER + 50) as i64;
    for seq in 1..=total {
        hub.publish(&event("task-1", seq, "tool.call.started"));
    }

    // The receiver observes a lag marker, then resumes with newer events.
    match rx.recv().await {
        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
        other => panic!("expected lag, got {:?}", other.map(|e| e.seq)),
    }
    let next = rx.recv().await.unwrap();
    assert!(next.seq > 1);
}

#[tokio::test]
async fn test_channel_pruned_after_last_listener_drops() {
    let hub = EventHub::new();
    let rx = hub.subscribe("task-1");
    assert_eq!(hub.channel_count(), 1);

    drop(rx);
    // The next publish notices the dead channel and prunes it.
    hub.publish(&event("task-1", 1, "task.running"));
    assert_eq!(hub.channel_count(), 0);
}

#[tokio::test]
async fn test_multiple_listeners_all_receive() {
    let hub = EventHub::new();
    let mut rx1 = hub.subscribe("task-1");
    let mut rx2 = hub.subscribe("task-1");

    hub.publish(&event("task-1", 1, "approval.requested"));

    assert_eq!(rx1.recv().await.unwrap().event_type, "approval.requested");
    assert_eq!(rx2.recv().await.unwrap().event_type, "approval.requested");
}
