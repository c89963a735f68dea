//! Test doubles for the pipeline's external collaborators.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use voxly::adapters::{
    AudioSource, BlobStore, Notifier, OperationStatus, PollSettings, RecognitionResult, Recognizer,
};
use voxly::core::{Collaborators, Orchestrator, PipelineSettings};
use voxly::domain::{QueueMessage, SourceRef, TaskMeta};
use voxly::ingest::{Producer, VoiceSubmission};
use voxly::queue::SqliteQueue;
use voxly::resilience::RetryConfig;
use voxly::store::SqliteStore;

pub const QUEUE: &str = "voice_processing";

/// Serves fixed bytes after failing `failures` times
pub struct FakeAudio {
    pub bytes: Vec<u8>,
    pub failures: AtomicU32,
    pub calls: AtomicU32,
}

impl FakeAudio {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(self, times: u32) -> Self {
        self.failures.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl AudioSource for FakeAudio {
    async fn fetch(&self, _file_ref: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("download interrupted");
        }
        Ok(self.bytes.clone())
    }
}

/// Records uploads and returns `mem://<key>`
#[derive(Default)]
pub struct FakeBlobs {
    pub uploads: Mutex<Vec<(String, usize, String)>>,
}

#[async_trait]
impl BlobStore for FakeBlobs {
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        self.uploads
            .lock()
            .unwrap()
            .push((key.to_string(), bytes.len(), content_type.to_string()));
        Ok(format!("mem://{}", key))
    }
}

/// How a recognition operation ends
#[derive(Clone)]
pub enum Outcome {
    Text(Vec<&'static str>),
    Failed(&'static str),
    /// Never finishes
    Hang,
}

/// Scripted recognizer: each started operation takes the next outcome
/// (the last one repeats) and stays Running for `running_polls` polls.
pub struct FakeRecognizer {
    outcomes: Mutex<VecDeque<Outcome>>,
    operations: Mutex<Vec<(String, Outcome, u32)>>,
    pub running_polls: u32,
    pub start_failures: AtomicU32,
    pub starts: AtomicU32,
    pub polls: AtomicU32,
    pub uris: Mutex<Vec<String>>,
}

impl FakeRecognizer {
    pub fn new(outcomes: Vec<Outcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            operations: Mutex::new(Vec::new()),
            running_polls: 0,
            start_failures: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            uris: Mutex::new(Vec::new()),
        }
    }

    pub fn text(segments: Vec<&'static str>) -> Self {
        Self::new(vec![Outcome::Text(segments)])
    }

    pub fn with_running_polls(mut self, polls: u32) -> Self {
        self.running_polls = polls;
        self
    }

    pub fn failing_starts(self, times: u32) -> Self {
        self.start_failures.store(times, Ordering::SeqCst);
        self
    }

    fn next_outcome(&self) -> Outcome {
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.pop_front().unwrap()
        } else {
            outcomes.front().cloned().unwrap_or(Outcome::Hang)
        }
    }
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start_recognition(&self, audio_uri: &str) -> Result<String> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        let left = self.start_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.start_failures.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("service unavailable");
        }
        self.uris.lock().unwrap().push(audio_uri.to_string());
        let id = format!("op-{}", n);
        let outcome = self.next_outcome();
        self.operations
            .lock()
            .unwrap()
            .push((id.clone(), outcome, self.running_polls));
        Ok(id)
    }

    async fn poll_operation(&self, operation_id: &str) -> Result<OperationStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut operations = self.operations.lock().unwrap();
        let Some(op) = operations.iter_mut().find(|(id, _, _)| id == operation_id) else {
            anyhow::bail!("unknown operation {}", operation_id);
        };
        if op.2 > 0 {
            op.2 -= 1;
            return Ok(OperationStatus::Running);
        }
        Ok(match &op.1 {
            Outcome::Text(segments) => {
                let result = RecognitionResult::from_segments(segments.iter().copied());
                OperationStatus::Done {
                    raw: json!({ "done": true, "response": serde_json::to_value(&result)? }),
                    result,
                }
            }
            Outcome::Failed(message) => OperationStatus::Failed {
                code: 13,
                message: message.to_string(),
            },
            Outcome::Hang => OperationStatus::Running,
        })
    }
}

/// Records every reply; optionally fails them all, or fails one send once
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(i64, Option<i64>, String)>>,
    pub fail: bool,
    pub max_chars: usize,
    /// Zero-based send attempt that fails
    pub fail_attempt: Option<u32>,
    attempts: AtomicU32,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: false,
            max_chars: 4096,
            fail_attempt: None,
            attempts: AtomicU32::new(0),
        }
    }
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Messages of at most `max_chars`; send attempt `attempt` fails once
    pub fn limited(max_chars: usize, fail_attempt: Option<u32>) -> Self {
        Self {
            max_chars,
            fail_attempt,
            ..Self::default()
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|s| s.2.clone()).collect()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn max_message_chars(&self) -> usize {
        self.max_chars
    }

    async fn deliver(&self, chat_id: i64, reply_to: Option<i64>, text: &str) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail || self.fail_attempt == Some(attempt) {
            anyhow::bail!("chat unreachable");
        }
        assert!(text.chars().count() <= self.max_chars, "oversized message");
        self.sent
            .lock()
            .unwrap()
            .push((chat_id, reply_to, text.to_string()));
        Ok(())
    }
}

/// Fast retries and a short poll so paused-clock tests stay quick
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        retry: RetryConfig {
            max_attempts: 3,
            initial_interval_ms: 10,
            max_interval_ms: 100,
            multiplier: 2.0,
        },
        poll: PollSettings {
            interval_secs: 1,
            max_wait_secs: 30,
        },
        ..PipelineSettings::default()
    }
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub queue: Arc<SqliteQueue>,
    pub audio: Arc<FakeAudio>,
    pub blobs: Arc<FakeBlobs>,
    pub recognizer: Arc<FakeRecognizer>,
    pub notifier: Arc<RecordingNotifier>,
    pub producer: Producer,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(recognizer: FakeRecognizer) -> Self {
        Self::build(
            FakeAudio::new(b"OggS-audio".to_vec()),
            recognizer,
            RecordingNotifier::default(),
            fast_settings(),
        )
    }

    pub fn build(
        audio: FakeAudio,
        recognizer: FakeRecognizer,
        notifier: RecordingNotifier,
        settings: PipelineSettings,
    ) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let audio = Arc::new(audio);
        let blobs = Arc::new(FakeBlobs::default());
        let recognizer = Arc::new(recognizer);
        let notifier = Arc::new(notifier);

        let producer = Producer::new(store.clone(), queue.clone(), QUEUE, settings.retry_ceiling);
        let orchestrator = Arc::new(Orchestrator::new(
            Collaborators {
                store: store.clone(),
                audio: audio.clone(),
                blobs: blobs.clone(),
                recognizer: recognizer.clone(),
                notifier: notifier.clone(),
            },
            settings,
        ));

        Self {
            store,
            queue,
            audio,
            blobs,
            recognizer,
            notifier,
            producer,
            orchestrator,
        }
    }

    /// Submit a voice message and return the message the worker would see
    pub async fn submit(&self, chat_id: i64, message_id: i64) -> QueueMessage {
        let result = self
            .producer
            .submit(VoiceSubmission {
                source: SourceRef::new(chat_id, message_id),
                file_id: format!("file-{}", message_id),
                meta: TaskMeta {
                    duration_secs: Some(4),
                    mime_type: Some("audio/ogg".to_string()),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert!(result.is_new());

        let task = voxly::store::TaskStore::get(self.store.as_ref(), result.id())
            .await
            .unwrap()
            .unwrap();
        QueueMessage::from(&task)
    }
}
