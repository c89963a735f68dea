//! SQLite-backed task and transcript store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use uuid::Uuid;

use super::{open_connection, StoreError, TaskStore};
use crate::domain::{SourceRef, Task, TaskMeta, TaskStatus, Transcript};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY,
    chat_id      INTEGER NOT NULL,
    message_id   INTEGER NOT NULL,
    file_id      TEXT NOT NULL,
    status       TEXT NOT NULL,
    operation_id TEXT,
    attempts     INTEGER NOT NULL DEFAULT 0,
    error_text   TEXT,
    meta         TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    UNIQUE (chat_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status, created_at);

CREATE TABLE IF NOT EXISTS transcripts (
    id           TEXT PRIMARY KEY,
    task_id      TEXT NOT NULL UNIQUE REFERENCES tasks (id) ON DELETE CASCADE,
    text         TEXT NOT NULL,
    raw_response TEXT,
    created_at   TEXT NOT NULL
);
";

const TASK_COLUMNS: &str = "id, chat_id, message_id, file_id, status, operation_id, attempts, \
                            error_text, meta, created_at, updated_at";

/// Task store on a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(open_connection(Some(path))?)
    }

    /// Private in-memory database, for tests and dry runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(open_connection(None)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Task counts per status
    pub fn counts(&self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row?;
            counts.push((parse_status(&status)?, count.max(0) as u64));
        }
        Ok(counts)
    }
}

/// Raw column values, converted to a [`Task`] outside the row closure
struct TaskRow {
    id: String,
    chat_id: i64,
    message_id: i64,
    file_id: String,
    status: String,
    operation_id: Option<String>,
    attempts: i64,
    error_text: Option<String>,
    meta: String,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            message_id: row.get(2)?,
            file_id: row.get(3)?,
            status: row.get(4)?,
            operation_id: row.get(5)?,
            attempts: row.get(6)?,
            error_text: row.get(7)?,
            meta: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let meta: TaskMeta = serde_json::from_str(&self.meta)?;
        Ok(Task {
            id: parse_uuid(&self.id)?,
            source: SourceRef::new(self.chat_id, self.message_id),
            file_id: self.file_id,
            status: parse_status(&self.status)?,
            operation_id: self.operation_id,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| StoreError::Corrupt(format!("attempts out of range: {}", self.attempts)))?,
            error_text: self.error_text,
            meta,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {:?}: {}", s, e)))
}

fn parse_status(s: &str) -> Result<TaskStatus, StoreError> {
    s.parse().map_err(StoreError::Corrupt)
}

/// Fixed-width UTC timestamps, so text order matches time order
pub(crate) fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn query_tasks(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, TaskRow::read)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?.into_task()?);
    }
    Ok(tasks)
}

/// Write the mutable fields of `task`, optionally only while the stored
/// status is `expected`
fn write_task(conn: &Connection, task: &Task, expected: Option<TaskStatus>) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE tasks
         SET file_id = ?2, status = ?3, operation_id = ?4, attempts = ?5,
             error_text = ?6, meta = ?7, updated_at = ?8
         WHERE id = ?1 AND (?9 IS NULL OR status = ?9)",
        params![
            task.id.to_string(),
            task.file_id,
            task.status.as_str(),
            task.operation_id,
            task.attempts,
            task.error_text,
            serde_json::to_string(&task.meta)?,
            fmt_time(&task.updated_at),
            expected.map(|s| s.as_str()),
        ],
    )?;
    if changed > 0 {
        return Ok(());
    }

    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM tasks WHERE id = ?1)",
        params![task.id.to_string()],
        |row| row.get(0),
    )?;
    match expected {
        Some(expected) if exists => Err(StoreError::Conflict { id: task.id, expected }),
        _ => Err(StoreError::NotFound(task.id)),
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                TASK_COLUMNS
            ),
            params![
                task.id.to_string(),
                task.source.chat_id,
                task.source.message_id,
                task.file_id,
                task.status.as_str(),
                task.operation_id,
                task.attempts,
                task.error_text,
                serde_json::to_string(&task.meta)?,
                fmt_time(&task.created_at),
                fmt_time(&task.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate(task.source)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.to_string()],
                TaskRow::read,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn find_by_source(&self, source: SourceRef) -> Result<Option<Task>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE chat_id = ?1 AND message_id = ?2",
                    TASK_COLUMNS
                ),
                params![source.chat_id, source.message_id],
                TaskRow::read,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn update(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.lock();
        write_task(&conn, task, None)
    }

    async fn update_if(&self, task: &Task, expected: TaskStatus) -> Result<(), StoreError> {
        let conn = self.lock();
        write_task(&conn, task, Some(expected))
    }

    async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        query_tasks(
            &conn,
            &format!(
                "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at, id LIMIT ?2",
                TASK_COLUMNS
            ),
            params![status.as_str(), limit],
        )
    }

    async fn complete(&self, task: &Task, transcript: &Transcript) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        write_task(&tx, task, Some(TaskStatus::InProgress))?;

        let inserted = tx.execute(
            "INSERT INTO transcripts (id, task_id, text, raw_response, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                transcript.id.to_string(),
                transcript.task_id.to_string(),
                transcript.text,
                transcript
                    .raw_response
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                fmt_time(&transcript.created_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::TranscriptExists(transcript.task_id));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit()?;
        Ok(())
    }

    async fn transcript(&self, task_id: Uuid) -> Result<Option<Transcript>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, task_id, text, raw_response, created_at FROM transcripts WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, task_id, text, raw, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Transcript {
            id: parse_uuid(&id)?,
            task_id: parse_uuid(&task_id)?,
            text,
            raw_response: raw.as_deref().map(serde_json::from_str).transpose()?,
            created_at: parse_time(&created_at)?,
        }))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
        Ok(changed > 0)
    }
}
