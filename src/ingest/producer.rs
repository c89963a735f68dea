//! Producer: turns voice messages into tasks and queue messages.
//!
//! Submission is idempotent on the source message: a second submission of
//! the same (chat, message) pair returns the existing task and publishes
//! nothing.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{QueueMessage, SourceRef, Task, TaskMeta, TaskStatus, TransitionError};
use crate::queue::{MessageQueue, QueueError};
use crate::store::{StoreError, TaskStore};

/// Errors from submitting work
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A voice message to transcribe
#[derive(Debug, Clone)]
pub struct VoiceSubmission {
    pub source: SourceRef,
    pub file_id: String,
    pub meta: TaskMeta,
}

/// Result of submitting a voice message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    /// New task created and published
    Queued(Uuid),

    /// Existing task still waiting or running
    AlreadyQueued(Uuid),

    /// Existing task already done
    AlreadyProcessed(Uuid),

    /// Existing task failed; use [`Producer::resubmit`] to retry it
    AlreadyFailed(Uuid),
}

impl SubmitResult {
    /// Get the task ID regardless of result type
    pub fn id(&self) -> Uuid {
        match self {
            Self::Queued(id)
            | Self::AlreadyQueued(id)
            | Self::AlreadyProcessed(id)
            | Self::AlreadyFailed(id) => *id,
        }
    }

    /// Check if this was a new submission
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Queued(_))
    }

    fn for_existing(task: &Task) -> Self {
        match task.status {
            TaskStatus::Queued | TaskStatus::InProgress => Self::AlreadyQueued(task.id),
            TaskStatus::Done => Self::AlreadyProcessed(task.id),
            TaskStatus::Failed => Self::AlreadyFailed(task.id),
        }
    }
}

/// Result of re-submitting a failed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResubmitResult {
    /// Back to Queued and published again
    Requeued(Uuid),

    /// Retry ceiling reached; the task stays Failed
    Exhausted { attempts: u32 },

    /// Only failed tasks can be re-submitted
    NotFailed(TaskStatus),
}

/// Creates tasks and publishes their queue messages
pub struct Producer {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
    retry_ceiling: u32,
}

impl Producer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn MessageQueue>,
        queue_name: impl Into<String>,
        retry_ceiling: u32,
    ) -> Self {
        Self {
            store,
            queue,
            queue_name: queue_name.into(),
            retry_ceiling,
        }
    }

    async fn publish(&self, task: &Task) -> Result<(), IngestError> {
        let payload = QueueMessage::from(task).to_bytes()?;
        self.queue.publish(&self.queue_name, &payload).await?;
        Ok(())
    }

    /// Create a task for `submission` and publish it, unless one exists.
    ///
    /// If publishing fails the task stays Queued without a message;
    /// [`Producer::recover_stale`] republishes it.
    #[instrument(skip(self, submission), fields(source = %submission.source))]
    pub async fn submit(&self, submission: VoiceSubmission) -> Result<SubmitResult, IngestError> {
        if let Some(existing) = self.store.find_by_source(submission.source).await? {
            info!(task_id = %existing.id, status = %existing.status, "Duplicate submission");
            return Ok(SubmitResult::for_existing(&existing));
        }

        let task = Task::new(submission.source, submission.file_id, submission.meta);
        match self.store.create(&task).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(source)) => {
                // Lost a race with a concurrent submission of the same message
                let existing = self
                    .store
                    .find_by_source(source)
                    .await?
                    .ok_or(StoreError::Duplicate(source))?;
                return Ok(SubmitResult::for_existing(&existing));
            }
            Err(e) => return Err(e.into()),
        }

        self.publish(&task).await?;
        info!(task_id = %task.id, "Task queued");
        Ok(SubmitResult::Queued(task.id))
    }

    /// Move a Failed task back to Queued and publish it again
    #[instrument(skip(self))]
    pub async fn resubmit(&self, task_id: Uuid) -> Result<ResubmitResult, IngestError> {
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or(IngestError::NotFound(task_id))?;

        match task.requeue(self.retry_ceiling) {
            Ok(()) => {}
            Err(TransitionError::RetriesExhausted { attempts }) => {
                warn!(attempts, "Retry ceiling reached, not resubmitting");
                return Ok(ResubmitResult::Exhausted { attempts });
            }
            Err(TransitionError::Invalid { from, .. }) => {
                return Ok(ResubmitResult::NotFailed(from));
            }
        }

        match self.store.update_if(&task, TaskStatus::Failed).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                let current = self.store.get(task_id).await?.map_or(task.status, |t| t.status);
                return Ok(ResubmitResult::NotFailed(current));
            }
            Err(e) => return Err(e.into()),
        }
        self.publish(&task).await?;
        info!(attempts = task.attempts, "Task resubmitted");
        Ok(ResubmitResult::Requeued(task.id))
    }

    /// Republish Queued and InProgress tasks untouched for `older_than`.
    ///
    /// Covers tasks whose message was never published and workers that died
    /// mid-cycle. A task that does have a live message gets a duplicate,
    /// which the orchestrator's status check absorbs.
    #[instrument(skip(self))]
    pub async fn recover_stale(
        &self,
        older_than: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<Uuid>, IngestError> {
        let cutoff = Utc::now() - older_than;
        let mut republished = Vec::new();

        for status in [TaskStatus::Queued, TaskStatus::InProgress] {
            for task in self.store.list_by_status(status, limit).await? {
                if republished.len() >= limit {
                    break;
                }
                if task.updated_at > cutoff {
                    continue;
                }
                self.publish(&task).await?;
                info!(task_id = %task.id, status = %task.status, "Republished stale task");
                republished.push(task.id);
            }
        }

        Ok(republished)
    }
}
