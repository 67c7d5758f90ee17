//! Database schema management.

use rusqlite::Connection;

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Known lanes
CREATE TABLE IF NOT EXISTS queues (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Durable tasks; rows exist only while queued or failed
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_name TEXT NOT NULL REFERENCES queues(name),
    task_type TEXT NOT NULL,
    category INTEGER NOT NULL,
    status TEXT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    retry_limit INTEGER NOT NULL,
    next_run_at TEXT NOT NULL,
    queued_at TEXT NOT NULL,
    last_error TEXT,
    state TEXT NOT NULL DEFAULT 'null'
);

-- Events outlive tasks that succeed, so task_id is not a foreign key
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    occurred_at TEXT NOT NULL,
    description TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT 'null',
    selected INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_lane ON tasks(queue_name, status, next_run_at, id);
CREATE INDEX IF NOT EXISTS idx_tasks_category ON tasks(category, status);
CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id);
CREATE INDEX IF NOT EXISTS idx_events_occurred ON events(occurred_at);
"#;
