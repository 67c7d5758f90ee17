//! Queue manager.
//!
//! The manager is the single entry point for producers and display code. It
//! persists tasks and events through a [`TaskStore`], keeps at most one lane
//! worker per queue name alive, and fans changes out to subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::event::{Event, EventId, NewEvent};
use crate::lane::{Lane, RunningTask};
use crate::listener::{EventChange, ListenerSet, Subscription, TaskChange};
use crate::registry::TaskRegistry;
use crate::sqlite_store::SqliteTaskStore;
use crate::store::TaskStore;
use crate::task::{Category, NewTask, Task, TaskId};

/// Outcome of [`QueueManager::delete_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// The task and its events were removed.
    Deleted,
    /// The task is running; it was asked to abort and is removed once it stops.
    Deferred,
    NotFound,
}

/// A live lane worker.
pub(crate) struct LaneHandle {
    lane_id: u64,
    wake: Arc<Notify>,
    running: Arc<SyncMutex<Option<RunningTask>>>,
    join: JoinHandle<()>,
}

impl LaneHandle {
    /// Cancel the running attempt if it is task `id`.
    fn request_abort(&self, id: TaskId) -> bool {
        match self.running.lock().as_ref() {
            Some(running) if running.id == id => {
                running.abort.cancel();
                true
            }
            _ => false,
        }
    }

    fn is_running(&self, id: TaskId) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| running.id == id)
    }
}

pub(crate) struct ManagerInner {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) config: QueueConfig,
    pub(crate) task_listeners: ListenerSet<TaskChange>,
    pub(crate) event_listeners: ListenerSet<EventChange>,
    pub(crate) shutdown: CancellationToken,
    lanes: Mutex<HashMap<String, LaneHandle>>,
    next_lane_id: AtomicU64,
}

impl ManagerInner {
    /// Wake the lane for `queue_name`, starting one if none is alive.
    async fn wake_or_start(self: &Arc<Self>, queue_name: &str) {
        let mut lanes = self.lanes.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }

        if let Some(handle) = lanes.get(queue_name) {
            handle.wake.notify_one();
            return;
        }

        let lane_id = self.next_lane_id.fetch_add(1, Ordering::Relaxed);
        let wake = Arc::new(Notify::new());
        let running = Arc::new(SyncMutex::new(None));
        let lane = Lane::new(
            queue_name.to_string(),
            lane_id,
            self.clone(),
            wake.clone(),
            running.clone(),
        );

        debug!(queue = %queue_name, lane_id, "Starting lane");
        lanes.insert(
            queue_name.to_string(),
            LaneHandle {
                lane_id,
                wake,
                running,
                join: tokio::spawn(lane.run()),
            },
        );
    }

    /// Called by an idle lane. Returns true if the lane may exit.
    ///
    /// The pending count is re-read under the lane map lock so an enqueue
    /// racing with the exit either sees the lane gone or wakes it.
    pub(crate) async fn retire_lane(&self, queue_name: &str, lane_id: u64) -> bool {
        let mut lanes = self.lanes.lock().await;
        match self.store.pending_count(queue_name).await {
            Ok(0) => {
                if lanes.get(queue_name).is_some_and(|h| h.lane_id == lane_id) {
                    lanes.remove(queue_name);
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(queue = %queue_name, error = %e, "Failed to count pending tasks");
                false
            }
        }
    }
}

/// Owner of all lanes. Cheap to clone.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl QueueManager {
    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    /// Start a manager over an existing store.
    ///
    /// Runs age-based cleanup when configured, then starts a lane for every
    /// queue that still has work from a previous run.
    pub async fn start(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        config: QueueConfig,
    ) -> QueueResult<Self> {
        config.validate()?;

        let manager = Self {
            inner: Arc::new(ManagerInner {
                store,
                registry,
                config,
                task_listeners: ListenerSet::new(),
                event_listeners: ListenerSet::new(),
                shutdown: CancellationToken::new(),
                lanes: Mutex::new(HashMap::new()),
                next_lane_id: AtomicU64::new(0),
            }),
        };

        if manager.inner.config.cleanup_on_start {
            manager.cleanup_old_tasks().await?;
            manager.cleanup_old_events().await?;
        }

        let queue_names = manager.inner.store.get_all_queue_names().await?;
        for name in &queue_names {
            manager.inner.wake_or_start(name).await;
        }

        info!(
            queues = queue_names.len(),
            handlers = manager.inner.registry.len(),
            "Queue manager started"
        );
        Ok(manager)
    }

    /// Open the store named by `config` and start a manager over it.
    pub async fn open(config: QueueConfig, registry: Arc<TaskRegistry>) -> QueueResult<Self> {
        let store: Arc<dyn TaskStore> = match &config.db_path {
            Some(path) => Arc::new(SqliteTaskStore::open(path).await?),
            None => Arc::new(SqliteTaskStore::in_memory().await?),
        };
        Self::start(store, registry, config).await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    /// Persist `task` in `queue_name` and make sure a lane will run it.
    pub async fn enqueue_task(&self, task: NewTask, queue_name: &str) -> QueueResult<TaskId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }

        let retry_limit = task
            .retry_limit
            .unwrap_or(self.inner.config.default_retry_limit);
        let stored = self
            .inner
            .store
            .enqueue_task(queue_name, &task, retry_limit)
            .await?;

        info!(
            queue = %queue_name,
            task_id = %stored.id,
            task_type = %stored.task_type,
            category = %stored.category,
            "Task enqueued"
        );
        self.inner.task_listeners.notify(TaskChange::Enqueued {
            id: stored.id,
            queue_name: queue_name.to_string(),
        });
        self.inner.wake_or_start(queue_name).await;

        Ok(stored.id)
    }

    /// Whether a task of `category` is still queued.
    ///
    /// Producers check this to avoid starting mutually exclusive jobs.
    pub async fn has_active_tasks(&self, category: Category) -> QueueResult<bool> {
        self.inner.store.has_active_tasks(category).await
    }

    /// Persist changed fields of a task. Returns false if the row is gone.
    pub async fn update_task(&self, task: &Task) -> QueueResult<bool> {
        self.inner.store.update_task(task).await
    }

    /// Delete a task and its events.
    ///
    /// A running task is only asked to abort; its lane deletes it once the
    /// attempt returns.
    pub async fn delete_task(&self, id: TaskId) -> QueueResult<Deletion> {
        let lanes = self.inner.lanes.lock().await;
        if lanes.values().any(|h| h.request_abort(id)) {
            drop(lanes);
            info!(task_id = %id, "Abort requested for running task");
            self.inner
                .task_listeners
                .notify(TaskChange::AbortRequested { id });
            return Ok(Deletion::Deferred);
        }

        let deleted = self.inner.store.delete_task(id).await?;
        // A lane may have claimed the row while it was being deleted.
        let claimed = lanes.values().any(|h| h.request_abort(id));
        if deleted {
            // Let a lane sleeping on this row re-poll, and retire if it is empty.
            for handle in lanes.values() {
                handle.wake.notify_one();
            }
        }
        drop(lanes);

        if deleted {
            info!(task_id = %id, "Task deleted");
            self.inner.task_listeners.notify(TaskChange::Deleted { id });
            Ok(Deletion::Deleted)
        } else if claimed {
            Ok(Deletion::Deferred)
        } else {
            Ok(Deletion::NotFound)
        }
    }

    /// Put a failed task back in its queue with a fresh retry budget.
    ///
    /// Returns false if the task does not exist or has not failed.
    pub async fn retry_task(&self, id: TaskId) -> QueueResult<bool> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }

        let Some(task) = self.inner.store.reset_failed_task(id, Utc::now()).await? else {
            return Ok(false);
        };

        info!(queue = %task.queue_name, task_id = %id, "Failed task requeued");
        self.inner.task_listeners.notify(TaskChange::Requeued { id });
        self.inner.wake_or_start(&task.queue_name).await;
        Ok(true)
    }

    /// Append an event for `task_id`.
    pub async fn store_event(&self, task_id: TaskId, event: NewEvent) -> QueueResult<Event> {
        let stored = self.inner.store.store_event(task_id, &event).await?;
        debug!(task_id = %task_id, event_id = %stored.id, "Event stored");
        self.inner.event_listeners.notify(EventChange::Stored {
            id: stored.id,
            task_id,
        });
        Ok(stored)
    }

    pub async fn delete_event(&self, id: EventId) -> QueueResult<bool> {
        let deleted = self.inner.store.delete_event(id).await?;
        if deleted {
            self.inner.event_listeners.notify(EventChange::Deleted { id });
        }
        Ok(deleted)
    }

    pub async fn set_event_selected(&self, id: EventId, selected: bool) -> QueueResult<bool> {
        let updated = self.inner.store.set_event_selected(id, selected).await?;
        if updated {
            self.inner
                .event_listeners
                .notify(EventChange::SelectionChanged { id, selected });
        }
        Ok(updated)
    }

    /// Delete events older than the configured retention, and events whose
    /// task no longer exists.
    pub async fn cleanup_old_events(&self) -> QueueResult<usize> {
        let cutoff = Utc::now() - self.inner.config.event_retention();
        let removed = self.inner.store.cleanup_events_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Old and orphaned events cleaned up");
            self.inner
                .event_listeners
                .notify(EventChange::CleanedUp { removed });
        }
        Ok(removed)
    }

    /// Delete failed tasks, and their events, queued before the configured retention.
    pub async fn cleanup_old_tasks(&self) -> QueueResult<usize> {
        let cutoff = Utc::now() - self.inner.config.task_retention();
        let removed = self.inner.store.cleanup_tasks_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Old failed tasks cleaned up");
            self.inner
                .task_listeners
                .notify(TaskChange::CleanedUp { removed });
        }
        Ok(removed)
    }

    /// All tasks, or those of one category, in queue order.
    pub async fn get_tasks(&self, category: Option<Category>) -> QueueResult<Vec<Task>> {
        self.inner.store.get_tasks(category).await
    }

    pub async fn get_task(&self, id: TaskId) -> QueueResult<Option<Task>> {
        self.inner.store.get_task(id).await
    }

    pub async fn get_all_events(&self) -> QueueResult<Vec<Event>> {
        self.inner.store.get_all_events().await
    }

    pub async fn get_task_events(&self, task_id: TaskId) -> QueueResult<Vec<Event>> {
        self.inner.store.get_task_events(task_id).await
    }

    /// Names of queues with a live lane, sorted.
    pub async fn active_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lanes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether task `id` is currently executing.
    pub async fn is_running(&self, id: TaskId) -> bool {
        self.inner
            .lanes
            .lock()
            .await
            .values()
            .any(|h| h.is_running(id))
    }

    pub fn subscribe_tasks(&self) -> Subscription<TaskChange> {
        self.inner.task_listeners.subscribe()
    }

    pub fn subscribe_events(&self) -> Subscription<EventChange> {
        self.inner.event_listeners.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop all lanes.
    ///
    /// Running attempts finish and persist their outcome; lanes still busy
    /// after the configured timeout are left detached. Queued tasks stay in
    /// the store for the next start.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let handles: Vec<(String, LaneHandle)> =
            self.inner.lanes.lock().await.drain().collect();
        let deadline = Instant::now() + self.inner.config.shutdown_timeout();

        for (name, handle) in handles {
            match tokio::time::timeout_at(deadline, handle.join).await {
                Ok(Ok(())) => debug!(queue = %name, "Lane joined"),
                Ok(Err(e)) => error!(queue = %name, error = %e, "Lane task failed"),
                Err(_) => warn!(queue = %name, "Lane still running at shutdown timeout"),
            }
        }

        info!("Queue manager shut down");
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
