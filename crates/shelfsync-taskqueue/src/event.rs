//! Non-fatal error events recorded by running tasks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Store-assigned event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event as produced by a task, before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    /// Human readable summary, e.g. "Book 'Dune' skipped: no ISBN".
    pub description: String,
    /// Opaque detail for display collaborators.
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A stored event. Only `selected` ever changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Task that recorded the event. The task row may already be gone.
    pub task_id: TaskId,
    pub occurred_at: DateTime<Utc>,
    pub description: String,
    pub payload: serde_json::Value,
    /// UI selection state.
    pub selected: bool,
}
