//! Durable state: tasks, transcripts and expiring key-value entries.
//!
//! The pipeline depends only on the [`TaskStore`] and [`KeyValueStore`]
//! capabilities; SQLite implementations are provided for both.

pub mod kv;
pub mod sqlite;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{SourceRef, Task, TaskStatus, Transcript};

pub use kv::SqliteKv;
pub use sqlite::SqliteStore;

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Task already exists for message {0}")]
    Duplicate(SourceRef),

    #[error("Transcript already exists for task {0}")]
    TranscriptExists(Uuid),

    /// The stored task was moved on by another writer
    #[error("Task {id} is no longer {expected}")]
    Conflict { id: Uuid, expected: TaskStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence of tasks and their transcripts
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with [`StoreError::Duplicate`] when a task
    /// for the same source message already exists.
    async fn create(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    async fn find_by_source(&self, source: SourceRef) -> Result<Option<Task>, StoreError>;

    /// Replace the mutable fields of an existing task.
    /// Fails with [`StoreError::NotFound`] when no row matches.
    async fn update(&self, task: &Task) -> Result<(), StoreError>;

    /// Like [`TaskStore::update`], but only while the stored status is
    /// `expected`; otherwise fails with [`StoreError::Conflict`].
    async fn update_if(&self, task: &Task, expected: TaskStatus) -> Result<(), StoreError>;

    /// Tasks with `status`, oldest first
    async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Persist `transcript` and the already-completed `task` atomically.
    /// The stored task must still be InProgress, else [`StoreError::Conflict`].
    async fn complete(&self, task: &Task, transcript: &Transcript) -> Result<(), StoreError>;

    async fn transcript(&self, task_id: Uuid) -> Result<Option<Transcript>, StoreError>;

    /// Delete a task; its transcript goes with it
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// String key-value entries with optional expiry
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Value for `key`, or `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Open a SQLite connection (in memory when `path` is `None`) with the
/// pragmas every store here relies on.
pub(crate) fn open_connection(path: Option<&Path>) -> Result<Connection, StoreError> {
    let conn = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = Connection::open(path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn
        }
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}
