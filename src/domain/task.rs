//! Task: one voice message moving through the transcription pipeline.
//!
//! Lifecycle:
//!
//! ```text
//! Queued ──► InProgress ──► Done
//!   ▲            │
//!   │            ▼
//!   └──────── Failed   (re-submission only while attempts < ceiling)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default number of failed cycles after which a task is permanently failed
pub const MAX_ATTEMPTS: u32 = 3;

/// Processing status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker
    Queued,

    /// A worker is running a processing cycle
    InProgress,

    /// Transcript persisted
    Done,

    /// Last cycle failed; see `error_text`
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [Self::Queued, Self::InProgress, Self::Done, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Errors from illegal lifecycle moves
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid task transition: {from} → {to}")]
    Invalid { from: TaskStatus, to: TaskStatus },

    #[error("Retry ceiling reached after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Where the voice message came from: a chat and a message inside it.
///
/// Unique per task; the basis for idempotent ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub chat_id: i64,
    pub message_id: i64,
}

impl SourceRef {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_id, self.message_id)
    }
}

/// Free-form attributes attached at submission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Audio duration in seconds, as reported by the chat platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,

    /// Audio size in bytes, as reported by the chat platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Anything else the submitter wants to keep
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A unit of transcription work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,

    pub source: SourceRef,

    /// Opaque reference used to download the audio
    pub file_id: String,

    pub status: TaskStatus,

    /// Recognition operation started during the current or last cycle
    pub operation_id: Option<String>,

    /// Failed processing cycles so far
    pub attempts: u32,

    /// Last failure reason; present only while Failed
    pub error_text: Option<String>,

    pub meta: TaskMeta,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new Queued task with a fresh id
    pub fn new(source: SourceRef, file_id: impl Into<String>, meta: TaskMeta) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source,
            file_id: file_id.into(),
            status: TaskStatus::Queued,
            operation_id: None,
            attempts: 0,
            error_text: None,
            meta,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn invalid(&self, to: TaskStatus) -> TransitionError {
        TransitionError::Invalid {
            from: self.status,
            to,
        }
    }

    /// Whether another cycle is allowed under `ceiling`
    pub fn can_retry(&self, ceiling: u32) -> bool {
        self.attempts < ceiling
    }

    /// Done, or Failed with no retries left
    pub fn is_terminal(&self, ceiling: u32) -> bool {
        match self.status {
            TaskStatus::Done => true,
            TaskStatus::Failed => !self.can_retry(ceiling),
            TaskStatus::Queued | TaskStatus::InProgress => false,
        }
    }

    /// Queued → InProgress.
    ///
    /// InProgress → InProgress is accepted for a redelivered task whose
    /// previous worker never finished.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        match self.status {
            TaskStatus::Queued | TaskStatus::InProgress => {
                self.status = TaskStatus::InProgress;
                self.touch();
                Ok(())
            }
            _ => Err(self.invalid(TaskStatus::InProgress)),
        }
    }

    /// Record the recognition operation started in this cycle
    pub fn record_operation(&mut self, operation_id: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != TaskStatus::InProgress {
            return Err(self.invalid(TaskStatus::InProgress));
        }
        self.operation_id = Some(operation_id.into());
        self.touch();
        Ok(())
    }

    /// InProgress → Done
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        if self.status != TaskStatus::InProgress {
            return Err(self.invalid(TaskStatus::Done));
        }
        self.status = TaskStatus::Done;
        self.error_text = None;
        self.touch();
        Ok(())
    }

    /// InProgress → Failed, counting the attempt
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != TaskStatus::InProgress {
            return Err(self.invalid(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.attempts = self.attempts.saturating_add(1);
        self.error_text = Some(reason.into());
        self.touch();
        Ok(())
    }

    /// Failed → Queued, allowed only below the retry ceiling
    pub fn requeue(&mut self, ceiling: u32) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Failed {
            return Err(self.invalid(TaskStatus::Queued));
        }
        if !self.can_retry(ceiling) {
            return Err(TransitionError::RetriesExhausted {
                attempts: self.attempts,
            });
        }
        self.status = TaskStatus::Queued;
        self.error_text = None;
        self.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(SourceRef::new(42, 7), "file-abc", TaskMeta::default())
    }

    #[test]
    fn test_new_task_is_queued() {
        let task = task();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 0);
        assert!(task.operation_id.is_none());
        assert!(task.error_text.is_none());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn test_happy_path() {
        let mut task = task();
        task.start().unwrap();
        task.record_operation("op-1").unwrap();
        task.complete().unwrap();

        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.operation_id.as_deref(), Some("op-1"));
        assert!(task.is_terminal(MAX_ATTEMPTS));
    }

    #[test]
    fn test_failure_counts_attempts_and_requeues() {
        let mut task = task();
        task.start().unwrap();
        task.fail("download failed").unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.error_text.as_deref(), Some("download failed"));

        task.requeue(MAX_ATTEMPTS).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.error_text.is_none());
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn test_requeue_refused_at_ceiling() {
        let mut task = task();
        for _ in 0..MAX_ATTEMPTS {
            task.start().unwrap();
            task.fail("boom").unwrap();
            if task.can_retry(MAX_ATTEMPTS) {
                task.requeue(MAX_ATTEMPTS).unwrap();
            }
        }

        assert_eq!(task.attempts, MAX_ATTEMPTS);
        assert!(task.is_terminal(MAX_ATTEMPTS));
        assert_eq!(
            task.requeue(MAX_ATTEMPTS),
            Err(TransitionError::RetriesExhausted { attempts: 3 })
        );
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut task = task();
        assert!(task.complete().is_err());
        assert!(task.fail("x").is_err());
        assert!(task.record_operation("op").is_err());
        assert!(task.requeue(MAX_ATTEMPTS).is_err());

        task.start().unwrap();
        task.complete().unwrap();
        assert_eq!(
            task.start(),
            Err(TransitionError::Invalid {
                from: TaskStatus::Done,
                to: TaskStatus::InProgress,
            })
        );
    }

    #[test]
    fn test_restart_of_in_progress_task() {
        let mut task = task();
        task.start().unwrap();
        task.record_operation("op-1").unwrap();
        task.start().unwrap();
        task.record_operation("op-2").unwrap();
        assert_eq!(task.operation_id.as_deref(), Some("op-2"));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_meta_keeps_extra_fields() {
        let json = r#"{"duration_secs":12,"mime_type":"audio/ogg","forwarded":true}"#;
        let meta: TaskMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.duration_secs, Some(12));
        assert_eq!(meta.extra.get("forwarded"), Some(&serde_json::Value::Bool(true)));
    }
}
