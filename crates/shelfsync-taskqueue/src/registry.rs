//! Task handler registry.
//!
//! Stored tasks only carry a type tag and a state blob. The registry maps the
//! tag back to the code that runs the task, possibly in a later process.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::context::TaskContext;
use crate::error::{QueueError, QueueResult};

/// Executable behavior for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Type tag stored with every task this handler runs.
    fn task_type(&self) -> &str;

    /// Run one attempt.
    ///
    /// `Ok(true)` removes the task. `Ok(false)`, an error or a panic schedules
    /// a retry. Long-running handlers should poll [`TaskContext::is_aborting`]
    /// and return once it is set.
    async fn run(&self, ctx: &TaskContext) -> QueueResult<bool>;
}

/// Registry of task handlers keyed by type tag.
pub struct TaskRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler.
    ///
    /// Returns an error if a handler with the same type tag is already registered.
    pub fn register(&self, handler: Arc<dyn TaskHandler>) -> QueueResult<()> {
        let task_type = handler.task_type().to_string();

        if self.handlers.contains_key(&task_type) {
            return Err(QueueError::AlreadyRegistered(task_type));
        }

        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Unregister a handler by type tag.
    pub fn unregister(&self, task_type: &str) -> QueueResult<()> {
        self.handlers
            .remove(task_type)
            .ok_or_else(|| QueueError::HandlerNotFound(task_type.to_string()))?;
        Ok(())
    }

    /// Get the handler for a type tag.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).map(|h| h.clone())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// List all registered type tags.
    pub fn task_types(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
