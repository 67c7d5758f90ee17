//! Execution context handed to a running task.

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::QueueResult;
use crate::event::{Event, NewEvent};
use crate::manager::QueueManager;
use crate::task::{Category, Task, TaskId};

/// What a [`TaskHandler`](crate::TaskHandler) sees while it runs.
pub struct TaskContext {
    task: Task,
    abort: CancellationToken,
    manager: QueueManager,
}

impl TaskContext {
    pub(crate) fn new(task: Task, abort: CancellationToken, manager: QueueManager) -> Self {
        Self {
            task,
            abort,
            manager,
        }
    }

    /// The task as it was when this attempt started.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn queue_name(&self) -> &str {
        &self.task.queue_name
    }

    pub fn category(&self) -> Category {
        self.task.category
    }

    /// 1 for the first attempt, 2 for the first retry, and so on.
    pub fn attempt(&self) -> u32 {
        self.task.retries + 1
    }

    /// Deserialize the task's state blob.
    pub fn state<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(self.task.state()?)
    }

    /// True once deletion of this task was requested.
    pub fn is_aborting(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Completes once deletion of this task was requested.
    pub async fn aborted(&self) {
        self.abort.cancelled().await
    }

    /// Record a non-fatal, per-item failure. The attempt itself can still succeed.
    pub async fn store_event(&self, event: NewEvent) -> QueueResult<Event> {
        self.manager.store_event(self.task.id, event).await
    }
}
