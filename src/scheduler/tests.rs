use super::*;
use crate::hub::EventHub;
use crate::registry::ToolRegistry;
use crate::runtime::adapter::ExecutionAdapter;
use crate::runtime::{LocalEchoRuntime, Runtime};
use crate::sources::ToolExecutor;
use crate::store::NewTask;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;

fn stack() -> (Arc<Repository>, Arc<InvocationPipeline>) {
    let repo = Arc::new(Repository::open_ephemeral(Arc::new(EventHub::new())).unwrap());
    let executor = ToolExecutor::new();
    let registry = Arc::new(ToolRegistry::new(repo.clone(), executor.clone()));
    let pipeline = Arc::new(InvocationPipeline::new(repo.clone(), registry, executor));
    (repo, pipeline)
}

fn scheduler_with(
    repo: &Arc<Repository>,
    pipeline: &Arc<InvocationPipeline>,
    runtimes: RuntimeRegistry,
) -> Arc<TaskScheduler> {
    TaskScheduler::new(
        repo.clone(),
        pipeline.clone(),
        Arc::new(runtimes),
        Duration::from_millis(50),
        4,
    )
}

fn queue_task(repo: &Repository, code: &str, runtime_id: &str) -> Task {
    repo.create_task(NewTask {
        workspace_id: "ws".to_string(),
        account_id: "acct".to_string(),
        code: code.to_string(),
        runtime_id: runtime_id.to_string(),
        timeout_ms: 5_000,
        metadata: HashMap::new(),
    })
    .unwrap()
}

/// Runtime double driven by a fixed behavior.
struct ScriptedRuntime {
    id: &'static str,
    behavior: Behavior,
    runs: AtomicUsize,
}

enum Behavior {
    Succeed(serde_json::Value),
    FailWith(&'static str),
    DenySignal(&'static str),
    TimeoutSignal,
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    fn id(&self) -> &str {
        self.id
    }

    fn label(&self) -> &str {
        "scripted test runtime"
    }

    async fn run(
        &self,
        _spec: RunSpec,
        _adapter: Arc<dyn ExecutionAdapter>,
    ) -> anyhow::Result<RunOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed(value) => Ok(RunOutcome::completed(Some(value.clone()))),
            Behavior::FailWith(message) => Ok(RunOutcome::failed(*message)),
            Behavior::DenySignal(reason) => Err(ControlSignal::ApprovalDenied {
                reason: (*reason).to_string(),
            }
            .into()),
            Behavior::TimeoutSignal => Err(ControlSignal::TaskTimeout.into()),
        }
    }
}

#[tokio::test]
async fn test_drain_completes_arithmetic_task() {
    let (repo, pipeline) = stack();
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(LocalEchoRuntime));
    let scheduler = scheduler_with(&repo, &pipeline, runtimes);

    let task = queue_task(&repo, "return 40 + 2", "local");
    assert_eq!(scheduler.drain_queue("test").await, 1);

    let done = repo.get_task(&task.id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(serde_json::json!(42)));
    assert_eq!(done.exit_code, Some(0));
    assert!(done.completed_at.is_some());

    let events: Vec<String> = repo
        .list_events(&task.id, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(events, vec!["task.running".to_string(), "task.completed".to_string()]);

    let completed = &repo.list_events(&task.id, 0).unwrap()[1];
    assert_eq!(completed.payload["status"], "completed");
    assert_eq!(completed.payload["exitCode"], 0);
    assert!(completed.payload["durationMs"].is_u64());
}

#[tokio::test]
async fn test_unknown_runtime_fails_task() {
    let (repo, pipeline) = stack();
    let scheduler = scheduler_with(&repo, &pipeline, RuntimeRegistry::new());

    let task = queue_task(&repo, "return 1", "does-not-exist");
    scheduler.drain_queue("test").await;

    let done = repo.get_task(&task.id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("Runtime not found"));
}

#[tokio::test]
async fn test_denied_signal_maps_to_denied_status() {
    let (repo, pipeline) = stack();
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(ScriptedRuntime {
        id: "deny",
        behavior: Behavior::DenySignal("admin.send: too dangerous"),
        runs: AtomicUsize::new(0),
    }));
    let scheduler = scheduler_with(&repo, &pipeline, runtimes);

    let task = queue_task(&repo, "x", "deny");
    scheduler.drain_queue("test").await;

    let done = repo.get_task(&task.id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Denied);
    assert!(done.error.unwrap().contains("too dangerous"));

    let events: Vec<String> = repo
        .list_events(&task.id, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&"task.denied".to_string()));
}

#[tokio::test]
async fn test_timeout_signal_maps_to_timed_out() {
    let (repo, pipeline) = stack();
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(ScriptedRuntime {
        id: "slow",
        behavior: Behavior::TimeoutSignal,
        runs: AtomicUsize::new(0),
    }));
    let scheduler = scheduler_with(&repo, &pipeline, runtimes);

    let task = queue_task(&repo, "x", "slow");
    scheduler.drain_queue("test").await;

    let done = repo.get_task(&task.id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::TimedOut);
}

#[tokio::test]
async fn test_each_task_claimed_by_at_most_one_worker() {
    let (repo, pipeline) = stack();
    let runtime = Arc::new(ScriptedRuntime {
        id: "counter",
        behavior: Behavior::Succeed(serde_json::json!(1)),
        runs: AtomicUsize::new(0),
    });

    let mut runtimes_a = RuntimeRegistry::new();
    runtimes_a.register(runtime.clone());
    let mut runtimes_b = RuntimeRegistry::new();
    runtimes_b.register(runtime.clone());
    let worker_a = scheduler_with(&repo, &pipeline, runtimes_a);
    let worker_b = scheduler_with(&repo, &pipeline, runtimes_b);

    for _ in 0..6 {
        queue_task(&repo, "x", "counter");
    }

    // Both workers drain concurrently until the queue is empty.
    let (a, b) = tokio::join!(
        async {
            let mut total = 0;
            loop {
                let n = worker_a.drain_queue("test-a").await;
                total += n;
                if repo.list_queued_task_ids(1).unwrap().is_empty() {
                    break total;
                }
            }
        },
        async {
            let mut total = 0;
            loop {
                let n = worker_b.drain_queue("test-b").await;
                total += n;
                if repo.list_queued_task_ids(1).unwrap().is_empty() {
                    break total;
                }
            }
        }
    );

    // Every task ran exactly once across both workers.
    assert_eq!(runtime.runs.load(Ordering::SeqCst), 6);
    assert_eq!(a + b, 6);
}

#[tokio::test]
async fn test_started_scheduler_picks_up_new_tasks() {
    let (repo, pipeline) = stack();
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(LocalEchoRuntime));
    let scheduler = scheduler_with(&repo, &pipeline, runtimes);

    let handle = scheduler.start();
    let task = queue_task(&repo, "return 7", "local");

    // The queue watch should trigger a drain well within the poll interval.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = repo.get_task(&task.id).unwrap().unwrap();
        if current.status.is_terminal() {
            assert_eq!(current.status, TaskStatus::Completed);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    scheduler.shutdown();
    let _ = handle.await;
}

#[tokio::test]
async fn test_terminal_task_is_not_redispatched() {
    let (repo, pipeline) = stack();
    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(LocalEchoRuntime));
    let scheduler = scheduler_with(&repo, &pipeline, runtimes);

    let task = queue_task(&repo, "return 1", "local");
    scheduler.drain_queue("first").await;
    let done = repo.get_task(&task.id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    let events_before = repo.list_events(&task.id, 0).unwrap().len();

    // Nothing queued anymore: draining again does not touch the task.
    assert_eq!(scheduler.drain_queue("second").await, 0);
    assert_eq!(repo.list_events(&task.id, 0).unwrap().len(), events_before);
}
