//! End-to-end tests for the task queue.
//!
//! These tests drive a real SQLite store through the public manager API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Barrier, Notify};
use tracing_subscriber::EnvFilter;

use shelfsync_taskqueue::{
    Category, Deletion, EventChange, NewEvent, NewTask, QueueConfig, QueueError, QueueManager,
    QueueResult, SqliteTaskStore, Subscription, TaskChange, TaskContext, TaskHandler, TaskId,
    TaskRegistry, TaskStatus, TaskStore,
};

// ============================================================================
// Test Helpers
// ============================================================================

const IMPORT: Category = Category(1);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn config(backoff_unit_ms: u64) -> QueueConfig {
    QueueConfig {
        backoff_unit_ms,
        shutdown_timeout_secs: 5,
        ..Default::default()
    }
}

async fn start(handler: Arc<dyn TaskHandler>, config: QueueConfig) -> QueueManager {
    init_tracing();
    let registry = Arc::new(TaskRegistry::new());
    registry.register(handler).unwrap();
    QueueManager::open(config, registry).await.unwrap()
}

async fn wait_for<T: std::fmt::Debug>(
    sub: &mut Subscription<T>,
    pred: impl Fn(&T) -> bool,
) -> T {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let change = sub.recv().await.unwrap();
            if pred(&change) {
                return change;
            }
        }
    })
    .await
    .unwrap()
}

/// Fails the first `failures` attempts and records when each attempt began.
struct FlakyHandler {
    failures: usize,
    started: Mutex<Vec<Instant>>,
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    fn task_type(&self) -> &str {
        "flaky"
    }

    async fn run(&self, _ctx: &TaskContext) -> QueueResult<bool> {
        let mut started = self.started.lock();
        started.push(Instant::now());
        Ok(started.len() > self.failures)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ImportState {
    titles: Vec<String>,
}

/// Records an event for every title without an ISBN, then succeeds.
struct ImportHandler;

#[async_trait]
impl TaskHandler for ImportHandler {
    fn task_type(&self) -> &str {
        "import"
    }

    async fn run(&self, ctx: &TaskContext) -> QueueResult<bool> {
        let state: ImportState = ctx.state()?;
        for title in &state.titles {
            ctx.store_event(
                NewEvent::new(format!("Book '{title}' skipped: no ISBN"))
                    .with_payload(json!({ "title": title })),
            )
            .await?;
        }
        Ok(true)
    }
}

/// Runs until it is asked to abort.
struct BlockingHandler {
    started: Arc<Notify>,
}

#[async_trait]
impl TaskHandler for BlockingHandler {
    fn task_type(&self) -> &str {
        "blocking"
    }

    async fn run(&self, ctx: &TaskContext) -> QueueResult<bool> {
        ctx.store_event(NewEvent::new("started")).await?;
        self.started.notify_one();
        ctx.aborted().await;
        assert!(ctx.is_aborting());
        Ok(true)
    }
}

/// Tracks how many attempts overlap and in which order tasks ran.
struct SerialHandler {
    active: AtomicUsize,
    max_active: AtomicUsize,
    order: Mutex<Vec<TaskId>>,
}

#[async_trait]
impl TaskHandler for SerialHandler {
    fn task_type(&self) -> &str {
        "serial"
    }

    async fn run(&self, ctx: &TaskContext) -> QueueResult<bool> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.order.lock().push(ctx.task_id());

        tokio::time::sleep(Duration::from_millis(2)).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Only succeeds when two attempts are in flight at once.
struct RendezvousHandler {
    barrier: Barrier,
}

#[async_trait]
impl TaskHandler for RendezvousHandler {
    fn task_type(&self) -> &str {
        "rendezvous"
    }

    async fn run(&self, _ctx: &TaskContext) -> QueueResult<bool> {
        self.barrier.wait().await;
        Ok(true)
    }
}

/// Always fails with an error.
struct BrokenHandler;

#[async_trait]
impl TaskHandler for BrokenHandler {
    fn task_type(&self) -> &str {
        "broken"
    }

    async fn run(&self, _ctx: &TaskContext) -> QueueResult<bool> {
        Err(QueueError::ExecutionFailed("catalogue offline".to_string()))
    }
}

// ============================================================================
// Integration Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fail_fail_succeed_waits_backoff() {
    let unit_ms = 10;
    let handler = Arc::new(FlakyHandler {
        failures: 2,
        started: Mutex::new(Vec::new()),
    });
    let manager = start(handler.clone(), config(unit_ms)).await;
    let mut sub = manager.subscribe_tasks();

    let id = manager
        .enqueue_task(NewTask::new("flaky", IMPORT), "sync")
        .await
        .unwrap();
    wait_for(&mut sub, |c| *c == TaskChange::Completed { id }).await;

    let started = handler.started.lock().clone();
    assert_eq!(started.len(), 3);
    assert!(started[1] - started[0] >= Duration::from_millis(4 * unit_ms));
    assert!(started[2] - started[1] >= Duration::from_millis(8 * unit_ms));
    assert!(manager.get_task(id).await.unwrap().is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_events_survive_task_success() {
    let manager = start(Arc::new(ImportHandler), config(10)).await;
    let mut sub = manager.subscribe_tasks();

    let state = ImportState {
        titles: vec!["Dune".into(), "Emma".into(), "Ulysses".into()],
    };
    let task = NewTask::new("import", IMPORT)
        .with_serialized_state(&state)
        .unwrap();
    let id = manager.enqueue_task(task, "import").await.unwrap();
    wait_for(&mut sub, |c| *c == TaskChange::Completed { id }).await;

    assert!(manager.get_task(id).await.unwrap().is_none());
    let events = manager.get_task_events(id).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].description, "Book 'Dune' skipped: no ISBN");
    assert_eq!(events[2].payload, json!({ "title": "Ulysses" }));
    assert!(events.iter().all(|e| e.task_id == id && !e.selected));
    assert_eq!(manager.get_all_events().await.unwrap().len(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_running_task_aborts_then_removes() {
    let started = Arc::new(Notify::new());
    let handler = Arc::new(BlockingHandler {
        started: started.clone(),
    });
    let manager = start(handler, config(10)).await;
    let mut tasks = manager.subscribe_tasks();
    let mut events = manager.subscribe_events();

    let id = manager
        .enqueue_task(NewTask::new("blocking", IMPORT), "sync")
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), started.notified())
        .await
        .unwrap();
    wait_for(&mut events, |c| matches!(c, EventChange::Stored { task_id, .. } if *task_id == id))
        .await;
    assert!(manager.is_running(id).await);

    assert_eq!(manager.delete_task(id).await.unwrap(), Deletion::Deferred);
    wait_for(&mut tasks, |c| *c == TaskChange::AbortRequested { id }).await;
    wait_for(&mut tasks, |c| *c == TaskChange::Deleted { id }).await;

    assert!(!manager.is_running(id).await);
    assert!(manager.get_task(id).await.unwrap().is_none());
    assert!(manager.get_task_events(id).await.unwrap().is_empty());

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueue_runs_one_at_a_time_in_order() {
    let handler = Arc::new(SerialHandler {
        active: AtomicUsize::new(0),
        max_active: AtomicUsize::new(0),
        order: Mutex::new(Vec::new()),
    });
    let manager = start(handler.clone(), config(10)).await;
    let mut sub = manager.subscribe_tasks();

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    manager
                        .enqueue_task(NewTask::new("serial", IMPORT), "sync")
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let mut completed = 0;
    while completed < 24 {
        wait_for(&mut sub, |c| matches!(c, TaskChange::Completed { .. })).await;
        completed += 1;
    }

    assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
    let order = handler.order.lock().clone();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted);
    assert_eq!(order.len(), 24);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_separate_lanes_run_concurrently() {
    let handler = Arc::new(RendezvousHandler {
        barrier: Barrier::new(2),
    });
    let manager = start(handler, config(10)).await;
    let mut sub = manager.subscribe_tasks();

    let a = manager
        .enqueue_task(NewTask::new("rendezvous", IMPORT), "covers")
        .await
        .unwrap();
    let b = manager
        .enqueue_task(NewTask::new("rendezvous", IMPORT), "prices")
        .await
        .unwrap();

    wait_for(&mut sub, |c| *c == TaskChange::Completed { id: a }).await;
    wait_for(&mut sub, |c| *c == TaskChange::Completed { id: b }).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_queued_task_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queue.db");

    // A previous process stored a task and stopped before running it.
    {
        let store = SqliteTaskStore::open(&db_path).await.unwrap();
        store
            .enqueue_task(
                "import",
                &NewTask::new("import", IMPORT).with_state(json!({ "titles": ["Dune"] })),
                15,
            )
            .await
            .unwrap();
    }

    let registry = Arc::new(TaskRegistry::new());
    registry.register(Arc::new(ImportHandler)).unwrap();
    let manager = QueueManager::open(
        QueueConfig {
            db_path: Some(db_path),
            ..config(10)
        },
        registry,
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while !manager.get_tasks(None).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let events = manager.get_all_events().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].description, "Book 'Dune' skipped: no ISBN");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retry_schedule_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queue.db");
    let persistent = |unit_ms| QueueConfig {
        db_path: Some(db_path.clone()),
        ..config(unit_ms)
    };

    let manager = start(Arc::new(BrokenHandler), persistent(60_000)).await;
    let mut sub = manager.subscribe_tasks();
    let id = manager
        .enqueue_task(
            NewTask::new("broken", IMPORT).with_state(json!({ "isbn": "9780441013593" })),
            "sync",
        )
        .await
        .unwrap();
    wait_for(&mut sub, |c| matches!(c, TaskChange::Retrying { .. })).await;
    let before = manager.get_task(id).await.unwrap().unwrap();
    manager.shutdown().await;
    drop(manager);

    let manager = start(Arc::new(BrokenHandler), persistent(60_000)).await;
    let after = manager.get_task(id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Queued);
    assert_eq!(after.retries, 1);
    assert_eq!(after.next_run_at, before.next_run_at);
    assert_eq!(after.state, json!({ "isbn": "9780441013593" }));
    assert_eq!(after.last_error.as_deref(), Some("Task execution failed: catalogue offline"));

    // The lane is back, waiting for the backoff to pass.
    assert_eq!(manager.active_queues().await, vec!["sync".to_string()]);
    assert!(manager.has_active_tasks(IMPORT).await.unwrap());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_task_can_be_retried_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queue.db");

    let manager = start(
        Arc::new(BrokenHandler),
        QueueConfig {
            db_path: Some(db_path.clone()),
            ..config(10)
        },
    )
    .await;
    let mut sub = manager.subscribe_tasks();
    let id = manager
        .enqueue_task(
            NewTask::new("import", IMPORT)
                .with_state(json!({ "titles": [] }))
                .with_retry_limit(0),
            "import",
        )
        .await
        .unwrap();
    wait_for(&mut sub, |c| *c == TaskChange::Failed { id }).await;
    manager.shutdown().await;
    drop(manager);

    // Restarted with the handler that was missing before.
    let manager = start(
        Arc::new(ImportHandler),
        QueueConfig {
            db_path: Some(db_path),
            ..config(10)
        },
    )
    .await;
    assert!(manager.active_queues().await.is_empty());
    assert_eq!(manager.get_task(id).await.unwrap().unwrap().status, TaskStatus::Failed);

    let mut sub = manager.subscribe_tasks();
    assert!(manager.retry_task(id).await.unwrap());
    wait_for(&mut sub, |c| *c == TaskChange::Completed { id }).await;

    manager.shutdown().await;
}
