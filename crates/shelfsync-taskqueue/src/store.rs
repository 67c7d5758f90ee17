//! Task persistence store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueResult;
use crate::event::{Event, EventId, NewEvent};
use crate::task::{Category, NewTask, Task, TaskId};

/// Result of asking the store for a lane's next task.
#[derive(Debug, Clone, PartialEq)]
pub enum LanePoll {
    /// The earliest queued task, due now.
    Ready(Task),
    /// Queued tasks exist, the earliest becomes due at this time.
    Waiting(DateTime<Utc>),
    /// No queued tasks remain for the lane.
    Empty,
}

/// Rows removed by an age-based cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub tasks: usize,
    pub events: usize,
}

/// Durable storage for queues, tasks and events.
///
/// Every method is atomic with respect to every other caller.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Register a queue name. Idempotent.
    async fn create_queue(&self, name: &str) -> QueueResult<()>;

    /// Persist a new task as queued and ready now; creates the queue row if needed.
    async fn enqueue_task(&self, queue_name: &str, task: &NewTask, retry_limit: u32)
    -> QueueResult<Task>;

    /// Names of queues that still hold queued tasks.
    async fn get_all_queue_names(&self) -> QueueResult<Vec<String>>;

    /// Load a task by id.
    async fn get_task(&self, id: TaskId) -> QueueResult<Option<Task>>;

    /// Select the next task for a lane by `(next_run_at, id)`.
    async fn next_task(&self, queue_name: &str, now: DateTime<Utc>) -> QueueResult<LanePoll>;

    /// Number of queued (not failed) tasks in a lane.
    async fn pending_count(&self, queue_name: &str) -> QueueResult<u64>;

    /// Persist retry state. Returns false when the row no longer exists.
    async fn update_task(&self, task: &Task) -> QueueResult<bool>;

    /// Move a failed task back to queued with a fresh retry budget.
    async fn reset_failed_task(&self, id: TaskId, now: DateTime<Utc>) -> QueueResult<Option<Task>>;

    /// All tasks, optionally restricted to one category, in id order.
    async fn get_tasks(&self, category: Option<Category>) -> QueueResult<Vec<Task>>;

    /// True iff a non-failed task of this category exists.
    async fn has_active_tasks(&self, category: Category) -> QueueResult<bool>;

    /// Append an event for a task.
    async fn store_event(&self, task_id: TaskId, event: &NewEvent) -> QueueResult<Event>;

    /// All events, oldest first.
    async fn get_all_events(&self) -> QueueResult<Vec<Event>>;

    /// Events recorded by one task, oldest first.
    async fn get_task_events(&self, task_id: TaskId) -> QueueResult<Vec<Event>>;

    /// Change the UI selection flag of an event.
    async fn set_event_selected(&self, id: EventId, selected: bool) -> QueueResult<bool>;

    /// Delete a task together with its events.
    async fn delete_task(&self, id: TaskId) -> QueueResult<bool>;

    /// Delete a task that succeeded. Its events are kept.
    async fn complete_task(&self, id: TaskId) -> QueueResult<bool>;

    /// Delete one event.
    async fn delete_event(&self, id: EventId) -> QueueResult<bool>;

    /// Delete events that occurred before `cutoff`, plus events whose task
    /// no longer exists. Returns both counts combined.
    async fn cleanup_events_older_than(&self, cutoff: DateTime<Utc>) -> QueueResult<usize>;

    /// Delete failed tasks queued before `cutoff`, with their events, and any
    /// events whose task no longer exists. Returns the number of tasks removed.
    async fn cleanup_tasks_older_than(&self, cutoff: DateTime<Utc>) -> QueueResult<usize>;

    /// Run both cleanups with the same age limit.
    async fn cleanup_older_than(&self, age: chrono::Duration) -> QueueResult<CleanupReport> {
        let cutoff = Utc::now() - age;
        let tasks = self.cleanup_tasks_older_than(cutoff).await?;
        let events = self.cleanup_events_older_than(cutoff).await?;
        Ok(CleanupReport { tasks, events })
    }
}
