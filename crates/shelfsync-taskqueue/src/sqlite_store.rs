//! SQLite task store implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::error::QueueResult;
use crate::event::{Event, EventId, NewEvent};
use crate::schema::init_schema;
use crate::store::{LanePoll, TaskStore};
use crate::task::{Category, NewTask, Task, TaskId, TaskStatus};

#[cfg(test)]
#[path = "sqlite_store_tests.rs"]
mod tests;

const TASK_COLUMNS: &str = "id, queue_name, task_type, category, status, retries, retry_limit, \
                            next_run_at, queued_at, last_error, state";

const EVENT_COLUMNS: &str = "id, task_id, occurred_at, description, payload, selected";

/// Events whose task row is gone, e.g. after the task succeeded.
const ORPHANED_EVENTS: &str = "DELETE FROM events WHERE task_id NOT IN (SELECT id FROM tasks)";

/// SQLite-backed task store.
///
/// All statements run on the connection's own thread, one call at a time,
/// so every method observes and leaves a consistent database.
pub struct SqliteTaskStore {
    conn: Connection,
}

impl SqliteTaskStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> QueueResult<Self> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| Ok(init_schema(conn)?)).await?;
        Ok(Self { conn })
    }

    /// Open (or create) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening task store at {:?}", path);
        let conn = Connection::open(path).await?;
        conn.call(|conn| Ok(init_schema(conn)?)).await?;
        Ok(Self { conn })
    }
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json(idx: usize, value: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    let status = TaskStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown task status '{status}'").into(),
        )
    })?;
    let next_run_at: String = row.get(7)?;
    let queued_at: String = row.get(8)?;
    let state: String = row.get(10)?;

    Ok(Task {
        id: TaskId(row.get(0)?),
        queue_name: row.get(1)?,
        task_type: row.get(2)?,
        category: Category(row.get(3)?),
        status,
        retries: row.get(5)?,
        retry_limit: row.get(6)?,
        next_run_at: parse_ts(7, &next_run_at)?,
        queued_at: parse_ts(8, &queued_at)?,
        last_error: row.get(9)?,
        state: parse_json(10, &state)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let occurred_at: String = row.get(2)?;
    let payload: String = row.get(4)?;

    Ok(Event {
        id: EventId(row.get(0)?),
        task_id: TaskId(row.get(1)?),
        occurred_at: parse_ts(2, &occurred_at)?,
        description: row.get(3)?,
        payload: parse_json(4, &payload)?,
        selected: row.get(5)?,
    })
}

fn select_task(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        [id],
        task_from_row,
    )
    .optional()
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_queue(&self, name: &str) -> QueueResult<()> {
        let name = name.to_string();
        let now = format_ts(&Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO queues (name, created_at) VALUES (?1, ?2)",
                    params![name, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn enqueue_task(
        &self,
        queue_name: &str,
        task: &NewTask,
        retry_limit: u32,
    ) -> QueueResult<Task> {
        let queue_name = queue_name.to_string();
        let task_type = task.task_type.clone();
        let category = task.category.0;
        let state = serde_json::to_string(&task.state)?;

        let stored = self
            .conn
            .call(move |conn| {
                // Stamped on the connection thread so ids and timestamps agree.
                let now = format_ts(&Utc::now());
                let tx = conn.transaction()?;

                tx.execute(
                    "INSERT OR IGNORE INTO queues (name, created_at) VALUES (?1, ?2)",
                    params![queue_name, now],
                )?;
                tx.execute(
                    "INSERT INTO tasks (queue_name, task_type, category, status, retries,
                                        retry_limit, next_run_at, queued_at, last_error, state)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6, NULL, ?7)",
                    params![
                        queue_name,
                        task_type,
                        category,
                        TaskStatus::Queued.as_str(),
                        retry_limit,
                        now,
                        state
                    ],
                )?;
                let id = tx.last_insert_rowid();
                let stored = select_task(&tx, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;

                tx.commit()?;
                Ok(stored)
            })
            .await?;

        debug!(task_id = %stored.id, queue = %stored.queue_name, "Stored task");
        Ok(stored)
    }

    async fn get_all_queue_names(&self) -> QueueResult<Vec<String>> {
        let names = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT q.name FROM queues q
                     WHERE EXISTS (SELECT 1 FROM tasks t
                                   WHERE t.queue_name = q.name AND t.status = 'queued')
                     ORDER BY q.name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await?;
        Ok(names)
    }

    async fn get_task(&self, id: TaskId) -> QueueResult<Option<Task>> {
        let task = self.conn.call(move |conn| Ok(select_task(conn, id.0)?)).await?;
        Ok(task)
    }

    async fn next_task(&self, queue_name: &str, now: DateTime<Utc>) -> QueueResult<LanePoll> {
        let queue_name = queue_name.to_string();
        let head = self
            .conn
            .call(move |conn| {
                let head = conn
                    .query_row(
                        &format!(
                            "SELECT {TASK_COLUMNS} FROM tasks
                             WHERE queue_name = ?1 AND status = 'queued'
                             ORDER BY next_run_at, id LIMIT 1"
                        ),
                        [&queue_name],
                        task_from_row,
                    )
                    .optional()?;
                Ok(head)
            })
            .await?;

        Ok(match head {
            None => LanePoll::Empty,
            Some(task) if task.next_run_at <= now => LanePoll::Ready(task),
            Some(task) => LanePoll::Waiting(task.next_run_at),
        })
    }

    async fn pending_count(&self, queue_name: &str) -> QueueResult<u64> {
        let queue_name = queue_name.to_string();
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE queue_name = ?1 AND status = 'queued'",
                    [&queue_name],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn update_task(&self, task: &Task) -> QueueResult<bool> {
        let id = task.id.0;
        let status = task.status.as_str();
        let retries = task.retries;
        let retry_limit = task.retry_limit;
        let next_run_at = format_ts(&task.next_run_at);
        let last_error = task.last_error.clone();
        let state = serde_json::to_string(&task.state)?;

        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = ?1, retries = ?2, retry_limit = ?3,
                     next_run_at = ?4, last_error = ?5, state = ?6 WHERE id = ?7",
                    params![status, retries, retry_limit, next_run_at, last_error, state, id],
                )?;
                Ok(changed)
            })
            .await?;
        Ok(changed > 0)
    }

    async fn reset_failed_task(&self, id: TaskId, now: DateTime<Utc>) -> QueueResult<Option<Task>> {
        let now = format_ts(&now);
        let task = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE tasks SET status = 'queued', retries = 0, next_run_at = ?1,
                     last_error = NULL WHERE id = ?2 AND status = 'failed'",
                    params![now, id.0],
                )?;
                let task = if changed > 0 { select_task(&tx, id.0)? } else { None };
                tx.commit()?;
                Ok(task)
            })
            .await?;
        Ok(task)
    }

    async fn get_tasks(&self, category: Option<Category>) -> QueueResult<Vec<Task>> {
        let tasks = self
            .conn
            .call(move |conn| {
                let tasks = match category {
                    Some(category) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {TASK_COLUMNS} FROM tasks WHERE category = ?1 ORDER BY id"
                        ))?;
                        let tasks = stmt
                            .query_map([category.0], task_from_row)?
                            .collect::<Result<Vec<_>, _>>()?;
                        tasks
                    }
                    None => {
                        let mut stmt =
                            conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))?;
                        let tasks = stmt
                            .query_map([], task_from_row)?
                            .collect::<Result<Vec<_>, _>>()?;
                        tasks
                    }
                };
                Ok(tasks)
            })
            .await?;
        Ok(tasks)
    }

    async fn has_active_tasks(&self, category: Category) -> QueueResult<bool> {
        let exists = self
            .conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS (SELECT 1 FROM tasks WHERE category = ?1 AND status != 'failed')",
                    [category.0],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await?;
        Ok(exists)
    }

    async fn store_event(&self, task_id: TaskId, event: &NewEvent) -> QueueResult<Event> {
        let description = event.description.clone();
        let payload = serde_json::to_string(&event.payload)?;
        let now = format_ts(&Utc::now());

        let stored = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO events (task_id, occurred_at, description, payload, selected)
                     VALUES (?1, ?2, ?3, ?4, 0)",
                    params![task_id.0, now, description, payload],
                )?;
                let id = tx.last_insert_rowid();
                let stored = tx.query_row(
                    &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                    [id],
                    event_from_row,
                )?;
                tx.commit()?;
                Ok(stored)
            })
            .await?;
        Ok(stored)
    }

    async fn get_all_events(&self) -> QueueResult<Vec<Event>> {
        let events = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events ORDER BY occurred_at, id"
                ))?;
                let events = stmt
                    .query_map([], event_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await?;
        Ok(events)
    }

    async fn get_task_events(&self, task_id: TaskId) -> QueueResult<Vec<Event>> {
        let events = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE task_id = ?1 ORDER BY occurred_at, id"
                ))?;
                let events = stmt
                    .query_map([task_id.0], event_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await?;
        Ok(events)
    }

    async fn set_event_selected(&self, id: EventId, selected: bool) -> QueueResult<bool> {
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE events SET selected = ?1 WHERE id = ?2",
                    params![selected, id.0],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    async fn delete_task(&self, id: TaskId) -> QueueResult<bool> {
        let changed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM events WHERE task_id = ?1", [id.0])?;
                let changed = tx.execute("DELETE FROM tasks WHERE id = ?1", [id.0])?;
                tx.commit()?;
                Ok(changed)
            })
            .await?;

        if changed > 0 {
            debug!(task_id = %id, "Deleted task");
        }
        Ok(changed > 0)
    }

    async fn complete_task(&self, id: TaskId) -> QueueResult<bool> {
        let changed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", [id.0])?))
            .await?;
        Ok(changed > 0)
    }

    async fn delete_event(&self, id: EventId) -> QueueResult<bool> {
        let changed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM events WHERE id = ?1", [id.0])?))
            .await?;
        Ok(changed > 0)
    }

    async fn cleanup_events_older_than(&self, cutoff: DateTime<Utc>) -> QueueResult<usize> {
        let cutoff = format_ts(&cutoff);
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let aged = tx.execute("DELETE FROM events WHERE occurred_at < ?1", [&cutoff])?;
                let orphaned = tx.execute(ORPHANED_EVENTS, [])?;
                tx.commit()?;
                Ok(aged + orphaned)
            })
            .await?;

        debug!(removed, "Cleaned up old and orphaned events");
        Ok(removed)
    }

    async fn cleanup_tasks_older_than(&self, cutoff: DateTime<Utc>) -> QueueResult<usize> {
        let cutoff = format_ts(&cutoff);
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM events WHERE task_id IN
                     (SELECT id FROM tasks WHERE status = 'failed' AND queued_at < ?1)",
                    [&cutoff],
                )?;
                let removed = tx.execute(
                    "DELETE FROM tasks WHERE status = 'failed' AND queued_at < ?1",
                    [&cutoff],
                )?;
                tx.execute(ORPHANED_EVENTS, [])?;
                tx.commit()?;
                Ok(removed)
            })
            .await?;

        debug!(removed, "Cleaned up old failed tasks");
        Ok(removed)
    }
}
