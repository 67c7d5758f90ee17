//! Per-lane worker.
//!
//! One worker runs the tasks of one queue name, strictly one at a time, in
//! `(next_run_at, id)` order. When nothing is due it sleeps until the
//! earliest `next_run_at` or until an enqueue wakes it. It exits once the
//! store holds no queued rows for the lane.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::TaskContext;
use crate::error::{QueueError, QueueResult};
use crate::listener::TaskChange;
use crate::manager::{ManagerInner, QueueManager};
use crate::store::LanePoll;
use crate::task::{FailureOutcome, Task, TaskId, TaskStatus};

/// The task a lane is currently running.
pub(crate) struct RunningTask {
    pub(crate) id: TaskId,
    pub(crate) abort: CancellationToken,
}

/// Result of one attempt, before it is persisted.
#[derive(Debug)]
enum Attempt {
    Succeeded,
    Failed(Option<String>),
}

pub(crate) struct Lane {
    name: String,
    lane_id: u64,
    inner: Arc<ManagerInner>,
    wake: Arc<Notify>,
    running: Arc<Mutex<Option<RunningTask>>>,
}

impl Lane {
    pub(crate) fn new(
        name: String,
        lane_id: u64,
        inner: Arc<ManagerInner>,
        wake: Arc<Notify>,
        running: Arc<Mutex<Option<RunningTask>>>,
    ) -> Self {
        Self {
            name,
            lane_id,
            inner,
            wake,
            running,
        }
    }

    /// Worker loop.
    pub(crate) async fn run(self) {
        info!(queue = %self.name, lane_id = self.lane_id, "Lane started");
        let error_delay = self.inner.config.store_error_delay();

        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }

            match self.inner.store.next_task(&self.name, Utc::now()).await {
                Ok(LanePoll::Ready(task)) => {
                    if let Err(e) = self.execute(task).await {
                        error!(queue = %self.name, error = %e, "Attempt abandoned");
                        if self.pause(error_delay).await {
                            break;
                        }
                    }
                }
                Ok(LanePoll::Waiting(at)) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    debug!(queue = %self.name, delay_ms = delay.as_millis() as u64, "Lane waiting");
                    if self.pause(delay).await {
                        break;
                    }
                }
                Ok(LanePoll::Empty) => {
                    if self.inner.retire_lane(&self.name, self.lane_id).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(queue = %self.name, error = %e, "Failed to poll lane");
                    if self.pause(error_delay).await {
                        break;
                    }
                }
            }
        }

        info!(queue = %self.name, lane_id = self.lane_id, "Lane stopped");
    }

    /// Sleep for `delay` or until woken. Returns true on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => true,
            _ = self.wake.notified() => false,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Run one attempt of `task` and persist its outcome.
    async fn execute(&self, task: Task) -> QueueResult<()> {
        let abort = CancellationToken::new();
        *self.running.lock() = Some(RunningTask {
            id: task.id,
            abort: abort.clone(),
        });

        // The row may have been deleted between selection and claim.
        let task = match self.inner.store.get_task(task.id).await {
            Ok(Some(current)) if current.status == TaskStatus::Queued => current,
            Ok(_) => {
                self.running.lock().take();
                return Ok(());
            }
            Err(e) => {
                self.running.lock().take();
                return Err(e);
            }
        };

        debug!(
            queue = %self.name,
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.retries + 1,
            "Running task"
        );
        let attempt = self.attempt(task.clone(), abort.clone()).await;
        self.running.lock().take();

        if abort.is_cancelled() {
            return self.finish_aborted(task.id).await;
        }

        match attempt {
            Attempt::Succeeded => self.finish_succeeded(task.id).await,
            Attempt::Failed(error) => self.finish_failed(task, error).await,
        }
    }

    async fn attempt(&self, task: Task, abort: CancellationToken) -> Attempt {
        let Some(handler) = self.inner.registry.get(&task.task_type) else {
            let err = QueueError::HandlerNotFound(task.task_type.clone());
            warn!(task_id = %task.id, error = %err, "Cannot run task");
            return Attempt::Failed(Some(err.to_string()));
        };

        let ctx = TaskContext::new(task, abort, QueueManager::from_inner(self.inner.clone()));
        match AssertUnwindSafe(handler.run(&ctx)).catch_unwind().await {
            Ok(Ok(true)) => Attempt::Succeeded,
            Ok(Ok(false)) => Attempt::Failed(None),
            Ok(Err(e)) => Attempt::Failed(Some(e.to_string())),
            Err(panic) => Attempt::Failed(Some(panic_message(panic.as_ref()))),
        }
    }

    async fn finish_aborted(&self, id: TaskId) -> QueueResult<()> {
        if self.inner.store.delete_task(id).await? {
            info!(queue = %self.name, task_id = %id, "Task aborted and deleted");
            self.inner.task_listeners.notify(TaskChange::Deleted { id });
        }
        Ok(())
    }

    async fn finish_succeeded(&self, id: TaskId) -> QueueResult<()> {
        if self.inner.store.complete_task(id).await? {
            info!(queue = %self.name, task_id = %id, "Task completed");
            self.inner.task_listeners.notify(TaskChange::Completed { id });
        }
        Ok(())
    }

    async fn finish_failed(&self, mut task: Task, error: Option<String>) -> QueueResult<()> {
        let unit = self.inner.config.backoff_unit();
        let outcome = task.record_failure(Utc::now(), unit, error);

        if !self.inner.store.update_task(&task).await? {
            // Deleted while running.
            return Ok(());
        }

        match outcome {
            FailureOutcome::Retry {
                retries,
                next_run_at,
            } => {
                warn!(
                    queue = %self.name,
                    task_id = %task.id,
                    retries,
                    retry_limit = task.retry_limit,
                    next_run_at = %next_run_at,
                    error = task.last_error.as_deref().unwrap_or("attempt returned false"),
                    "Task failed, retrying"
                );
                self.inner.task_listeners.notify(TaskChange::Retrying {
                    id: task.id,
                    retries,
                    next_run_at,
                });
            }
            FailureOutcome::Failed => {
                error!(
                    queue = %self.name,
                    task_id = %task.id,
                    retries = task.retries,
                    error = task.last_error.as_deref().unwrap_or("attempt returned false"),
                    "Task failed permanently"
                );
                self.inner
                    .task_listeners
                    .notify(TaskChange::Failed { id: task.id });
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}
