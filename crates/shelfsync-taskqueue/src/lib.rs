//! # ShelfSync Task Queue
//!
//! Persistent background task queue for the book catalogue.
//!
//! ## Features
//!
//! - Named lanes, each running its tasks one at a time in order
//! - Task and event persistence (SQLite) that survives restarts
//! - Retry with exponential backoff and a per-task retry limit
//! - Cooperative abort of running tasks
//! - Error-event log with age-based cleanup
//! - Change subscriptions for display code

pub mod backoff;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
mod lane;
pub mod listener;
pub mod manager;
pub mod registry;
pub mod schema;
pub mod sqlite_store;
pub mod store;
pub mod task;

pub use backoff::backoff;
pub use config::QueueConfig;
pub use context::TaskContext;
pub use error::{QueueError, QueueResult};
pub use event::{Event, EventId, NewEvent};
pub use listener::{EventChange, Subscription, TaskChange};
pub use manager::{Deletion, QueueManager};
pub use registry::{TaskHandler, TaskRegistry};
pub use sqlite_store::SqliteTaskStore;
pub use store::{CleanupReport, LanePoll, TaskStore};
pub use task::{Category, FailureOutcome, NewTask, Task, TaskId, TaskStatus};
