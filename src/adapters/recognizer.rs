//! Long-running speech recognition: HTTP client and cancellable polling.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Recognizer;
use crate::resilience::sleep_or_cancel;

// ============================================================================
// Recognition result
// ============================================================================

/// One alternative transcription of a chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: f64,
}

/// A recognized segment of audio
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_tag: Option<String>,
}

/// Structured recognition output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

impl RecognitionResult {
    /// Build a result with one chunk per segment, for tests and fakes
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = segments
            .into_iter()
            .map(|text| Chunk {
                alternatives: vec![Alternative {
                    text: text.into(),
                    confidence: 1.0,
                }],
                channel_tag: None,
            })
            .collect();
        Self { chunks }
    }

    /// Every alternative's text, in order, each followed by a single space
    pub fn full_text(&self) -> String {
        let mut text = String::new();
        for alternative in self.chunks.iter().flat_map(|c| &c.alternatives) {
            text.push_str(&alternative.text);
            text.push(' ');
        }
        text
    }
}

/// State of a recognition operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Running,

    /// Finished; `raw` is the response exactly as the service returned it
    Done {
        result: RecognitionResult,
        raw: serde_json::Value,
    },

    /// Finished with a service-reported error
    Failed { code: i64, message: String },
}

// ============================================================================
// Polling
// ============================================================================

/// How to wait for an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    /// Seconds between status checks (default: 5)
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Give up after this many seconds (default: 1800 = 30 min)
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_max_wait() -> u64 {
    1800
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            max_wait_secs: default_max_wait(),
        }
    }
}

/// Why waiting for an operation ended without a result
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),

    #[error("recognition failed: {message} (code: {code})")]
    Operation { code: i64, message: String },

    #[error("operation status check failed: {0:#}")]
    Poll(anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,
}

/// Poll `operation_id` until it finishes, the wait limit passes, or `cancel`
/// fires. Returns the structured result and the raw response.
pub async fn wait_for_result(
    recognizer: &dyn Recognizer,
    operation_id: &str,
    poll: &PollSettings,
    cancel: &CancellationToken,
) -> Result<(RecognitionResult, serde_json::Value), WaitError> {
    let interval = Duration::from_secs(poll.interval_secs.max(1));
    let max_wait = Duration::from_secs(poll.max_wait_secs);
    let started = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        if started.elapsed() > max_wait {
            return Err(WaitError::Timeout(max_wait));
        }

        match recognizer
            .poll_operation(operation_id)
            .await
            .map_err(WaitError::Poll)?
        {
            OperationStatus::Done { result, raw } => {
                info!(
                    operation_id,
                    chunks = result.chunks.len(),
                    "Recognition completed"
                );
                return Ok((result, raw));
            }
            OperationStatus::Failed { code, message } => {
                return Err(WaitError::Operation { code, message });
            }
            OperationStatus::Running => {
                debug!(
                    operation_id,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Recognition in progress"
                );
            }
        }

        sleep_or_cancel(interval, cancel)
            .await
            .map_err(|_| WaitError::Cancelled)?;
    }
}

// ============================================================================
// HTTP client
// ============================================================================

/// Connection and model settings for [`HttpRecognizer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerSettings {
    /// API key sent as `Authorization: Api-Key <key>`
    #[serde(default)]
    pub api_key: Option<String>,

    /// Folder (project) id sent as `x-folder-id`
    #[serde(default)]
    pub folder_id: Option<String>,

    #[serde(default = "default_recognize_url")]
    pub recognize_url: String,

    #[serde(default = "default_operation_url")]
    pub operation_url: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_encoding")]
    pub audio_encoding: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate_hertz: u32,

    /// Per-request HTTP timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_recognize_url() -> String {
    "https://transcribe.api.cloud.yandex.net/speech/stt/v2/longRunningRecognize".to_string()
}
fn default_operation_url() -> String {
    "https://operation.api.cloud.yandex.net/operations".to_string()
}
fn default_language() -> String {
    "ru-RU".to_string()
}
fn default_model() -> String {
    "general:rc".to_string()
}
fn default_encoding() -> String {
    "OGG_OPUS".to_string()
}
fn default_sample_rate() -> u32 {
    48000
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            folder_id: None,
            recognize_url: default_recognize_url(),
            operation_url: default_operation_url(),
            language: default_language(),
            model: default_model(),
            audio_encoding: default_encoding(),
            sample_rate_hertz: default_sample_rate(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Specification<'a> {
    language_code: &'a str,
    model: &'a str,
    audio_encoding: &'a str,
    sample_rate_hertz: u32,
    audio_channel_count: u32,
    profanity_filter: bool,
    literature_text: bool,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    id: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

impl OperationResponse {
    fn into_status(self) -> Result<OperationStatus> {
        if !self.done {
            return Ok(OperationStatus::Running);
        }
        if let Some(error) = self.error {
            return Ok(OperationStatus::Failed {
                code: error.code,
                message: error.message,
            });
        }

        let raw = self.response.unwrap_or(serde_json::Value::Null);
        let result = if raw.is_null() {
            RecognitionResult::default()
        } else {
            serde_json::from_value(raw.clone()).context("Malformed recognition response")?
        };
        Ok(OperationStatus::Done { result, raw })
    }
}

/// Recognizer backed by a long-running-operation HTTP API
pub struct HttpRecognizer {
    settings: RecognizerSettings,
    client: reqwest::Client,
}

impl HttpRecognizer {
    pub fn new(settings: RecognizerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { settings, client })
    }

    fn auth_header(&self) -> Result<String> {
        let key = self
            .settings
            .api_key
            .as_deref()
            .context("Recognizer API key is not configured")?;
        Ok(format!("Api-Key {}", key))
    }

    fn request_body(&self, audio_uri: &str) -> serde_json::Value {
        let spec = Specification {
            language_code: &self.settings.language,
            model: &self.settings.model,
            audio_encoding: &self.settings.audio_encoding,
            sample_rate_hertz: self.settings.sample_rate_hertz,
            audio_channel_count: 1,
            profanity_filter: false,
            literature_text: true,
        };
        serde_json::json!({
            "config": { "specification": spec },
            "audio": { "uri": audio_uri },
        })
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    fn name(&self) -> &str {
        "speechkit"
    }

    async fn start_recognition(&self, audio_uri: &str) -> Result<String> {
        let mut request = self
            .client
            .post(&self.settings.recognize_url)
            .header("Authorization", self.auth_header()?)
            .json(&self.request_body(audio_uri));
        if let Some(folder) = &self.settings.folder_id {
            request = request.header("x-folder-id", folder);
        }

        let response = request.send().await.context("Failed to start recognition")?;
        let status = response.status();
        let body = response.text().await.context("Failed to read recognition response")?;
        if !status.is_success() {
            anyhow::bail!("Recognition request rejected: status={}, body={}", status, body);
        }

        let operation: OperationResponse =
            serde_json::from_str(&body).context("Failed to parse recognition response")?;
        info!(operation_id = %operation.id, "Recognition started");
        Ok(operation.id)
    }

    async fn poll_operation(&self, operation_id: &str) -> Result<OperationStatus> {
        let url = format!(
            "{}/{}",
            self.settings.operation_url.trim_end_matches('/'),
            operation_id
        );
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header()?)
            .send()
            .await
            .context("Failed to check operation")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read operation response")?;
        if !status.is_success() {
            anyhow::bail!("Operation check failed: status={}, body={}", status, body);
        }

        let operation: OperationResponse =
            serde_json::from_str(&body).context("Failed to parse operation response")?;
        operation.into_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_full_text_appends_space_per_segment() {
        let result = RecognitionResult::from_segments(["hello", "world"]);
        assert_eq!(result.full_text(), "hello world ");
        assert_eq!(RecognitionResult::default().full_text(), "");
    }

    #[test]
    fn test_full_text_includes_every_alternative() {
        let json = r#"{"chunks":[
            {"alternatives":[{"text":"a","confidence":0.9},{"text":"b"}],"channelTag":"1"},
            {"alternatives":[{"text":"c"}]}
        ]}"#;
        let result: RecognitionResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.full_text(), "a b c ");
        assert_eq!(result.chunks[0].channel_tag.as_deref(), Some("1"));
    }

    #[test]
    fn test_operation_response_states() {
        let running: OperationResponse = serde_json::from_str(r#"{"id":"op","done":false}"#).unwrap();
        assert_eq!(running.into_status().unwrap(), OperationStatus::Running);

        let failed: OperationResponse = serde_json::from_str(
            r#"{"id":"op","done":true,"error":{"code":3,"message":"bad audio"}}"#,
        )
        .unwrap();
        assert_eq!(
            failed.into_status().unwrap(),
            OperationStatus::Failed {
                code: 3,
                message: "bad audio".to_string()
            }
        );

        let done: OperationResponse = serde_json::from_str(
            r#"{"id":"op","done":true,"response":{"chunks":[{"alternatives":[{"text":"hi"}]}]}}"#,
        )
        .unwrap();
        match done.into_status().unwrap() {
            OperationStatus::Done { result, raw } => {
                assert_eq!(result.full_text(), "hi ");
                assert!(raw.get("chunks").is_some());
            }
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn test_request_body_shape() {
        let recognizer = HttpRecognizer::new(RecognizerSettings::default()).unwrap();
        let body = recognizer.request_body("https://blobs/voice/a.ogg");
        assert_eq!(body["audio"]["uri"], "https://blobs/voice/a.ogg");
        assert_eq!(body["config"]["specification"]["languageCode"], "ru-RU");
        assert_eq!(body["config"]["specification"]["sampleRateHertz"], 48000);
    }

    /// Reports Running a fixed number of times, then Done
    struct SlowRecognizer {
        polls: AtomicU32,
        running_for: u32,
    }

    #[async_trait]
    impl Recognizer for SlowRecognizer {
        async fn start_recognition(&self, _audio_uri: &str) -> Result<String> {
            Ok("op-1".to_string())
        }

        async fn poll_operation(&self, _operation_id: &str) -> Result<OperationStatus> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.running_for {
                Ok(OperationStatus::Running)
            } else {
                Ok(OperationStatus::Done {
                    result: RecognitionResult::from_segments(["done"]),
                    raw: serde_json::Value::Null,
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_until_done() {
        let recognizer = SlowRecognizer {
            polls: AtomicU32::new(0),
            running_for: 3,
        };
        let token = CancellationToken::new();
        let started = Instant::now();

        let (result, _) = wait_for_result(&recognizer, "op-1", &PollSettings::default(), &token)
            .await
            .unwrap();

        assert_eq!(result.full_text(), "done ");
        assert_eq!(recognizer.polls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let recognizer = SlowRecognizer {
            polls: AtomicU32::new(0),
            running_for: u32::MAX,
        };
        let poll = PollSettings {
            interval_secs: 5,
            max_wait_secs: 60,
        };
        let token = CancellationToken::new();

        let err = wait_for_result(&recognizer, "op-1", &poll, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled_between_polls() {
        let recognizer = SlowRecognizer {
            polls: AtomicU32::new(0),
            running_for: u32::MAX,
        };
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let err = wait_for_result(&recognizer, "op-1", &PollSettings::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Cancelled));
        assert_eq!(recognizer.polls.load(Ordering::SeqCst), 2);
    }
}
