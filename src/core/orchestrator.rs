//! Pipeline orchestrator: one processing cycle per queue message.
//!
//! A cycle loads the task, checks it still needs work, downloads and stores
//! the audio, runs recognition, persists the transcript and replies to the
//! originator. Every failure ends in a task state change and a queue
//! disposition; nothing escapes to the consumer loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::adapters::{
    content_type_for, object_key, split_message, wait_for_result, AudioSource, BlobStore, Notifier,
    Recognizer, WaitError,
};
use crate::domain::{QueueMessage, SourceRef, Task, TaskStatus, Transcript, TransitionError};
use crate::queue::{Disposition, MessageHandler};
use crate::resilience::{retry_with_backoff, BreakerError, CircuitBreaker, RateLimiter, RetryError};
use crate::store::{StoreError, TaskStore};

use super::settings::PipelineSettings;

/// Why a processing cycle did not produce a transcript.
///
/// The `Display` text is what ends up in the task's `error_text`.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("audio download failed: {0}")]
    Fetch(String),

    #[error("audio download timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error("audio too large: {size} bytes (limit {limit})")]
    AudioTooLarge { size: u64, limit: u64 },

    #[error("audio upload failed: {0}")]
    Upload(String),

    #[error("recognition service unavailable: circuit breaker is open")]
    CircuitOpen,

    #[error("failed to start recognition: {0}")]
    RecognitionStart(String),

    #[error("{0}")]
    Recognition(WaitError),

    #[error("no text recognized")]
    NothingRecognized,

    #[error("failed to persist task state: {0}")]
    Persist(#[from] StoreError),

    #[error("{0}")]
    Transition(#[from] TransitionError),

    #[error("cycle cancelled")]
    Cancelled,
}

fn retry_failure(err: RetryError<anyhow::Error>, wrap: fn(String) -> CycleError) -> CycleError {
    match err {
        RetryError::Cancelled => CycleError::Cancelled,
        RetryError::Exhausted { last, .. } => wrap(format!("{:#}", last)),
    }
}

/// Store errors meaning a concurrent delivery moved the task on
fn superseded(err: &StoreError) -> bool {
    matches!(err, StoreError::Conflict { .. } | StoreError::TranscriptExists(_))
}

/// External capabilities a cycle needs
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn TaskStore>,
    pub audio: Arc<dyn AudioSource>,
    pub blobs: Arc<dyn BlobStore>,
    pub recognizer: Arc<dyn Recognizer>,
    pub notifier: Arc<dyn Notifier>,
}

/// Runs processing cycles; usable directly or as a queue [`MessageHandler`]
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    audio: Arc<dyn AudioSource>,
    blobs: Arc<dyn BlobStore>,
    recognizer: Arc<dyn Recognizer>,
    notifier: Arc<dyn Notifier>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    settings: PipelineSettings,
}

impl Orchestrator {
    /// Create an orchestrator with its own breaker and rate limiter
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        Self {
            store: collaborators.store,
            audio: collaborators.audio,
            blobs: collaborators.blobs,
            recognizer: collaborators.recognizer,
            notifier: collaborators.notifier,
            breaker: Arc::new(CircuitBreaker::from_settings(&settings.breaker)),
            limiter: Arc::new(RateLimiter::from_settings(&settings.rate_limit)),
            settings,
        }
    }

    /// Share a breaker and limiter with other orchestrators in the process
    pub fn with_resilience(mut self, breaker: Arc<CircuitBreaker>, limiter: Arc<RateLimiter>) -> Self {
        self.breaker = breaker;
        self.limiter = limiter;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Another delivery of the same task finished or failed it first
    fn superseded_ack(&self, cause: &StoreError) -> Disposition {
        info!(reason = %cause, "Task already settled by another delivery, acknowledging");
        Disposition::Ack
    }

    fn backoff(&self, attempts: u32) -> Disposition {
        Disposition::Requeue {
            delay: self.settings.retry.delay_for_attempt(attempts.max(1)),
        }
    }

    /// Run one cycle for `message` and decide how the delivery is settled
    #[instrument(
        skip(self, message, shutdown),
        fields(task_id = %message.task_id, chat_id = message.chat_id)
    )]
    pub async fn process(&self, message: &QueueMessage, shutdown: &CancellationToken) -> Disposition {
        let ceiling = self.settings.retry_ceiling;

        let mut task = match self.store.get(message.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                error!("Task referenced by queue message does not exist, discarding message");
                return Disposition::Reject {
                    reason: format!("task {} not found", message.task_id),
                };
            }
            Err(e) => {
                warn!(error = %e, "Failed to load task, requeueing");
                return self.backoff(1);
            }
        };

        let source = SourceRef::new(message.chat_id, message.message_id);
        if task.source != source {
            error!(
                task_source = %task.source,
                message_source = %source,
                "Queue message does not match its task, discarding message"
            );
            return Disposition::Reject {
                reason: format!("message source {} does not match task {}", source, task.id),
            };
        }

        let stored = task.status;
        match task.status {
            TaskStatus::Done => {
                info!("Task already done, acknowledging duplicate delivery");
                return Disposition::Ack;
            }
            TaskStatus::Failed if !task.can_retry(ceiling) => {
                info!(attempts = task.attempts, "Task already failed permanently");
                return Disposition::Ack;
            }
            TaskStatus::Failed => {
                if let Err(e) = task.requeue(ceiling) {
                    warn!(error = %e, "Cannot requeue failed task");
                    return Disposition::Ack;
                }
            }
            TaskStatus::InProgress => {
                warn!("Task was left in progress by an earlier delivery, restarting cycle");
            }
            TaskStatus::Queued => {}
        }

        if let Err(e) = task.start() {
            error!(error = %e, "Cannot start task");
            return Disposition::Ack;
        }
        match self.store.update_if(&task, stored).await {
            Ok(()) => {}
            Err(e) if superseded(&e) => return self.superseded_ack(&e),
            Err(e) => return self.fail_cycle(&mut task, e.into()).await,
        }
        info!(attempt = task.attempts + 1, "Processing cycle started");

        match self.run_cycle(&mut task, shutdown).await {
            Ok(text) => {
                info!(chars = text.chars().count(), "Transcript stored");
                self.deliver(task.source, &text).await;
                Disposition::Ack
            }
            Err(CycleError::Persist(e)) if superseded(&e) => self.superseded_ack(&e),
            Err(CycleError::Cancelled) => {
                info!("Cycle interrupted by shutdown, task left in progress");
                Disposition::Requeue {
                    delay: Duration::ZERO,
                }
            }
            Err(e) => self.fail_cycle(&mut task, e).await,
        }
    }

    async fn run_cycle(&self, task: &mut Task, shutdown: &CancellationToken) -> Result<String, CycleError> {
        let audio = self.fetch_audio(&task.file_id, shutdown).await?;
        let size = audio.len() as u64;
        if size > self.settings.max_audio_bytes {
            return Err(CycleError::AudioTooLarge {
                size,
                limit: self.settings.max_audio_bytes,
            });
        }

        let mime_type = task.meta.mime_type.as_deref();
        let key = object_key(task.id, Utc::now(), mime_type);
        let content_type = content_type_for(mime_type);
        let uri = retry_with_backoff(&self.settings.retry, shutdown, || {
            self.blobs.upload(&key, &audio, content_type)
        })
        .await
        .map_err(|e| retry_failure(e, CycleError::Upload))?;
        info!(key = %key, store = self.blobs.name(), "Audio stored");

        self.limiter
            .acquire(shutdown)
            .await
            .map_err(|_| CycleError::Cancelled)?;
        let operation_id = self
            .breaker
            .call(|| self.recognizer.start_recognition(&uri))
            .await
            .map_err(|e| match e {
                BreakerError::Open => CycleError::CircuitOpen,
                BreakerError::Inner(e) => CycleError::RecognitionStart(format!("{:#}", e)),
            })?;

        task.record_operation(operation_id.as_str())?;
        self.store.update_if(task, TaskStatus::InProgress).await?;
        info!(operation_id = %operation_id, "Recognition started");

        let (result, raw) = wait_for_result(
            self.recognizer.as_ref(),
            &operation_id,
            &self.settings.poll,
            shutdown,
        )
        .await
        .map_err(|e| match e {
            WaitError::Cancelled => CycleError::Cancelled,
            other => CycleError::Recognition(other),
        })?;

        let text = result.full_text();
        if text.trim().is_empty() {
            return Err(CycleError::NothingRecognized);
        }

        let transcript = Transcript::new(task.id, text.clone(), Some(raw));
        let mut done = task.clone();
        done.complete()?;
        self.store.complete(&done, &transcript).await?;
        *task = done;

        Ok(text)
    }

    async fn fetch_audio(&self, file_id: &str, shutdown: &CancellationToken) -> Result<Vec<u8>, CycleError> {
        let limit = self.settings.fetch_timeout();
        let fetch = retry_with_backoff(&self.settings.retry, shutdown, || self.audio.fetch(file_id));

        match tokio::time::timeout(limit, fetch).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(retry_failure(e, CycleError::Fetch)),
            Err(_) => Err(CycleError::FetchTimeout(limit)),
        }
    }

    /// Record a failed cycle. Below the ceiling the message goes back to the
    /// queue with backoff; at the ceiling the user is told and it is acked.
    async fn fail_cycle(&self, task: &mut Task, cause: CycleError) -> Disposition {
        let reason = cause.to_string();
        if let Err(e) = task.fail(reason.as_str()) {
            error!(error = %e, "Cannot mark task failed");
            return self.backoff(task.attempts + 1);
        }
        warn!(attempts = task.attempts, error = %reason, "Processing cycle failed");

        if let Err(e) = self.store.update_if(task, TaskStatus::InProgress).await {
            if superseded(&e) {
                return self.superseded_ack(&e);
            }
            error!(error = %e, "Failed to record task failure, requeueing");
            return self.backoff(task.attempts);
        }

        if task.can_retry(self.settings.retry_ceiling) {
            let disposition = self.backoff(task.attempts);
            if let Disposition::Requeue { delay } = &disposition {
                info!(delay_ms = delay.as_millis() as u64, "Task will be retried");
            }
            return disposition;
        }

        error!(attempts = task.attempts, "Task failed permanently");
        self.deliver(task.source, &self.settings.failure_message).await;
        Disposition::Ack
    }

    /// Send `text` as a reply to the source message, split to the notifier's
    /// size limit. Each part is retried on its own so a part already sent is
    /// never sent again. Failures are logged only; delivery is attempted even
    /// while shutting down.
    async fn deliver(&self, source: SourceRef, text: &str) {
        let uninterrupted = CancellationToken::new();
        let parts = split_message(text, self.notifier.max_message_chars());

        for (i, part) in parts.iter().enumerate() {
            // Only the first part is threaded under the original message
            let reply_to = (i == 0).then_some(source.message_id);
            let result = retry_with_backoff(&self.settings.retry, &uninterrupted, || {
                self.notifier.deliver(source.chat_id, reply_to, part)
            })
            .await;

            if let Err(e) = result {
                error!(
                    chat_id = source.chat_id,
                    part = i + 1,
                    parts = parts.len(),
                    error = %e,
                    "Failed to deliver reply"
                );
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for Orchestrator {
    async fn handle(&self, payload: &[u8], shutdown: &CancellationToken) -> Disposition {
        match QueueMessage::from_bytes(payload) {
            Ok(message) => self.process(&message, shutdown).await,
            Err(e) => {
                error!(error = %e, "Undecodable queue message, discarding");
                Disposition::Reject {
                    reason: format!("undecodable payload: {}", e),
                }
            }
        }
    }
}
