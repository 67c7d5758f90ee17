//! Queue configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Database path for task persistence (None = in-memory database).
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Retry limit given to tasks that don't set their own.
    #[serde(default = "default_retry_limit")]
    pub default_retry_limit: u32,

    /// Length of one backoff time unit in milliseconds.
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,

    /// Events older than this are removed by cleanup.
    #[serde(default = "default_retention_days")]
    pub event_retention_days: u32,

    /// Failed tasks queued before this are removed by cleanup.
    #[serde(default = "default_retention_days")]
    pub task_retention_days: u32,

    /// Run both cleanups when the manager starts.
    #[serde(default = "default_cleanup_on_start")]
    pub cleanup_on_start: bool,

    /// Pause after a store error inside a lane loop.
    #[serde(default = "default_store_error_delay_ms")]
    pub store_error_delay_ms: u64,

    /// How long shutdown waits for in-flight attempts.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Upper bound for retention settings, so cleanup cutoffs stay in range.
const MAX_RETENTION_DAYS: u32 = 36_500;

fn default_retry_limit() -> u32 {
    15
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_on_start() -> bool {
    true
}

fn default_store_error_delay_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            default_retry_limit: default_retry_limit(),
            backoff_unit_ms: default_backoff_unit_ms(),
            event_retention_days: default_retention_days(),
            task_retention_days: default_retention_days(),
            cleanup_on_start: default_cleanup_on_start(),
            store_error_delay_ms: default_store_error_delay_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// Accepts either a bare config or one nested under `[queue]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    Nested { queue: QueueConfig },
    Flat(QueueConfig),
}

impl QueueConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> QueueResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a TOML string.
    pub fn load_str(content: &str) -> QueueResult<Self> {
        let expanded = expand_env_vars(content)?;
        let mut config = match toml::from_str::<ConfigFile>(&expanded)? {
            ConfigFile::Nested { queue } => queue,
            ConfigFile::Flat(config) => config,
        };
        if let Some(path) = config.db_path.take() {
            let expanded = shellexpand::tilde(&path.to_string_lossy()).to_string();
            config.db_path = Some(PathBuf::from(expanded));
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> QueueResult<()> {
        if self.backoff_unit_ms == 0 {
            return Err(QueueError::InvalidConfig {
                field: "backoff_unit_ms".to_string(),
                message: "must be positive".to_string(),
            });
        }
        for (field, days) in [
            ("event_retention_days", self.event_retention_days),
            ("task_retention_days", self.task_retention_days),
        ] {
            if days == 0 || days > MAX_RETENTION_DAYS {
                return Err(QueueError::InvalidConfig {
                    field: field.to_string(),
                    message: format!("must be between 1 and {MAX_RETENTION_DAYS} days"),
                });
            }
        }
        Ok(())
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn event_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.event_retention_days))
    }

    pub fn task_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.task_retention_days))
    }

    pub fn store_error_delay(&self) -> Duration {
        Duration::from_millis(self.store_error_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Expand environment variables in the format `${VAR}`.
fn expand_env_vars(content: &str) -> QueueResult<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| QueueError::InvalidConfig {
        field: "env".to_string(),
        message: e.to_string(),
    })?;

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| QueueError::EnvVarNotSet(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }
    Ok(result)
}
