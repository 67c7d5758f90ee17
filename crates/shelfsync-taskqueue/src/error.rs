//! Queue errors.

use thiserror::Error;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    /// Event not found.
    #[error("Event not found: {0}")]
    EventNotFound(i64),

    /// No handler registered for a task type.
    #[error("No handler registered for task type: {0}")]
    HandlerNotFound(String),

    /// A handler for this task type is already registered.
    #[error("Handler already registered for task type: {0}")]
    AlreadyRegistered(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Task execution failed.
    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    /// Task state could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Invalid value for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// Environment variable referenced by the config is not set.
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// The manager has been shut down.
    #[error("Queue manager is shut down")]
    ShutDown,
}

impl From<tokio_rusqlite::Error> for QueueError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
