use crate::errors::ControlSignal;
use crate::invoke::InvocationPipeline;
use crate::runtime::adapter::InProcessAdapter;
use crate::runtime::{RunOutcome, RunSpec, RunStatus, RuntimeRegistry};
use crate::store::Repository;
use crate::store::types::{EventFamily, Task, TaskStatus};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Queue worker: claims queued tasks, drives a runtime, and records the
/// terminal outcome. Multiple workers (or processes) are safe because the
/// claim is a conditional store write.
pub struct TaskScheduler {
    repo: Arc<Repository>,
    pipeline: Arc<InvocationPipeline>,
    runtimes: Arc<RuntimeRegistry>,
    poll_interval: Duration,
    batch_size: usize,
    /// Single-flight guard: at most one drain per worker at a time.
    draining: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TaskScheduler {
    pub fn new(
        repo: Arc<Repository>,
        pipeline: Arc<InvocationPipeline>,
        runtimes: Arc<RuntimeRegistry>,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            pipeline,
            runtimes,
            poll_interval,
            batch_size: batch_size.max(1),
            draining: AtomicBool::new(false),
            shutdown_tx: watch::channel(false).0,
        })
    }

    /// Run the pump until shutdown: drain on queue-watch updates, and poll
    /// on a fixed interval to cover missed notifications.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut queue_rx = scheduler.repo.subscribe_queue();
            let mut shutdown_rx = scheduler.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(scheduler.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                "task scheduler started (poll {}ms, batch {})",
                scheduler.poll_interval.as_millis(),
                scheduler.batch_size
            );
            loop {
                tokio::select! {
                    changed = queue_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        scheduler.drain_queue("onUpdate").await;
                    }
                    _ = ticker.tick() => {
                        scheduler.drain_queue("poll").await;
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
            info!("task scheduler stopped");
        })
    }

    /// Signal the pump to stop after any in-flight drain finishes.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Drain up to one batch of queued tasks. Re-entrant calls while a drain
    /// is in flight return immediately. Returns how many tasks this worker
    /// dispatched.
    pub async fn drain_queue(&self, trigger: &str) -> usize {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in flight (trigger: {})", trigger);
            return 0;
        }
        let dispatched = self.drain_inner(trigger).await;
        self.draining.store(false, Ordering::SeqCst);
        dispatched
    }

    async fn drain_inner(&self, trigger: &str) -> usize {
        let ids = match self.repo.list_queued_task_ids(self.batch_size) {
            Ok(ids) => ids,
            Err(e) => {
                error!("failed to list queued tasks: {:#}", e);
                return 0;
            }
        };
        if ids.is_empty() {
            return 0;
        }
        debug!("draining {} task(s) (trigger: {})", ids.len(), trigger);

        let mut dispatched = 0;
        for task_id in ids {
            match self.dispatch(&task_id).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => error!("dispatch of {} failed: {:#}", task_id, e),
            }
        }
        dispatched
    }

    /// Claim and run one task. Returns whether this worker ran it.
    async fn dispatch(&self, task_id: &str) -> Result<bool> {
        let Some(task) = self.repo.get_task(task_id)? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Queued {
            return Ok(false);
        }

        let Some(runtime) = self.runtimes.get(&task.runtime_id) else {
            warn!("task {} names unknown runtime {}", task.id, task.runtime_id);
            self.finish(
                &task,
                TaskStatus::Failed,
                None,
                Some("Runtime not found"),
                None,
                0,
            )?;
            return Ok(true);
        };

        // The conditional flip is the claim; a `None` here means another
        // worker owns the task.
        let Some(task) = self.repo.mark_task_running(&task.id)? else {
            return Ok(false);
        };
        self.repo.append_event(
            &task.id,
            EventFamily::Task,
            "task.running",
            json!({"status": "running", "runtimeId": task.runtime_id}),
        )?;

        let adapter = Arc::new(InProcessAdapter::new(self.pipeline.clone(), task.id.clone()));
        let spec = RunSpec {
            task_id: task.id.clone(),
            code: task.code.clone(),
            timeout_ms: task.timeout_ms,
        };
        let started = Instant::now();
        let run = runtime.run(spec, adapter).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match run {
            Ok(outcome) => self.record_outcome(&task, outcome, duration_ms)?,
            Err(e) => {
                // Uncaught dispatch errors fall back to failed, unless they
                // decode to a control signal.
                let (status, error) = match ControlSignal::decode(&e) {
                    Some(ControlSignal::ApprovalDenied { reason }) => {
                        (TaskStatus::Denied, reason)
                    }
                    Some(ControlSignal::TaskTimeout) => {
                        (TaskStatus::TimedOut, "TASK_TIMEOUT".to_string())
                    }
                    _ => (TaskStatus::Failed, format!("{:#}", e)),
                };
                self.finish(&task, status, None, Some(&error), None, duration_ms)?;
            }
        }
        Ok(true)
    }

    fn record_outcome(&self, task: &Task, outcome: RunOutcome, duration_ms: u64) -> Result<()> {
        let status = match outcome.status {
            RunStatus::Completed => TaskStatus::Completed,
            RunStatus::Failed => TaskStatus::Failed,
            RunStatus::TimedOut => TaskStatus::TimedOut,
            RunStatus::Denied => TaskStatus::Denied,
        };
        self.finish(
            task,
            status,
            outcome.exit_code,
            outcome.error.as_deref(),
            outcome.result.as_ref(),
            duration_ms,
        )
    }

    fn finish(
        &self,
        task: &Task,
        status: TaskStatus,
        exit_code: Option<i64>,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
        duration_ms: u64,
    ) -> Result<()> {
        let finished = self
            .repo
            .finish_task(&task.id, status, exit_code, error, result)?;
        if finished.is_none() {
            // Already terminal; terminal monotonicity wins over this write.
            warn!(
                "task {} was already terminal; dropping {} outcome",
                task.id,
                status.as_str()
            );
            return Ok(());
        }

        let mut payload = json!({
            "status": status.as_str(),
            "durationMs": duration_ms,
        });
        if let Some(exit_code) = exit_code {
            payload["exitCode"] = json!(exit_code);
        }
        if let Some(error) = error {
            payload["error"] = json!(error);
        }
        self.repo.append_event(
            &task.id,
            EventFamily::Task,
            &format!("task.{}", status.as_str()),
            payload,
        )?;
        info!(
            "task {} finished {} in {}ms",
            task.id,
            status.as_str(),
            duration_ms
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests;
