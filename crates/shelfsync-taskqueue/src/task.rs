//! Task definition and status.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::backoff;

/// Store-assigned task identifier. Ids grow with enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification used to detect mutually exclusive work across producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub i32);

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted task status. Running is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting for its next attempt.
    Queued,
    /// Retry budget exhausted. Kept until a user deletes or retries it.
    Failed,
}

impl TaskStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Failed => "failed",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskStatus::Queued),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// A task built by a producer that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Type tag used to find the handler.
    pub task_type: String,
    /// Mutual-exclusion category.
    pub category: Category,
    /// Retry limit; None takes the configured default.
    pub retry_limit: Option<u32>,
    /// Opaque handler state.
    pub state: serde_json::Value,
}

impl NewTask {
    /// Create a new task of the given type with no state.
    pub fn new(task_type: impl Into<String>, category: Category) -> Self {
        Self {
            task_type: task_type.into(),
            category,
            retry_limit: None,
            state: serde_json::Value::Null,
        }
    }

    /// Set the handler state.
    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }

    /// Set the handler state from any serializable value.
    pub fn with_serialized_state<T: Serialize>(mut self, state: &T) -> Result<Self, serde_json::Error> {
        self.state = serde_json::to_value(state)?;
        Ok(self)
    }

    /// Set the retry limit.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue_name: String,
    pub task_type: String,
    pub category: Category,
    pub status: TaskStatus,
    pub retries: u32,
    pub retry_limit: u32,
    /// Earliest time of the next attempt.
    pub next_run_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    /// Message of the most recent failed attempt.
    pub last_error: Option<String>,
    pub state: serde_json::Value,
}

/// What a failed attempt did to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Requeued for another attempt.
    Retry { retries: u32, next_run_at: DateTime<Utc> },
    /// Budget exhausted.
    Failed,
}

impl Task {
    /// Check if the retry budget has room for another attempt.
    pub fn can_retry(&self) -> bool {
        self.retries < self.retry_limit
    }

    /// Check if the task may run at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.next_run_at <= now
    }

    /// Apply a failed attempt observed at `now`.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        unit: Duration,
        error: Option<String>,
    ) -> FailureOutcome {
        self.last_error = error;

        if !self.can_retry() {
            self.status = TaskStatus::Failed;
            return FailureOutcome::Failed;
        }

        self.retries += 1;
        let delay = chrono::Duration::from_std(backoff(self.retries, unit))
            .unwrap_or(chrono::Duration::MAX);
        let candidate = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.next_run_at = self.next_run_at.max(candidate);

        FailureOutcome::Retry {
            retries: self.retries,
            next_run_at: self.next_run_at,
        }
    }

    /// Deserialize the handler state.
    pub fn state<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state.clone())
    }
}
