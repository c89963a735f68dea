//! Telegram Bot API adapter.
//!
//! Serves as the pipeline's audio source (voice files are downloaded by
//! `file_id`) and notifier (transcripts are sent as replies), and feeds the
//! bot front-end with updates.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{AudioSource, Notifier};

/// Telegram refuses messages longer than this many characters
pub const MAX_MESSAGE_CHARS: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram Bot API client
pub struct TelegramClient {
    /// Bot token
    bot_token: String,
    /// API root, overridable for a local Bot API server
    api_base: String,
    /// HTTP client
    client: reqwest::Client,
}

/// Response from Telegram API
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Message result from sendMessage
#[derive(Debug, Deserialize)]
struct MessageResult {
    message_id: i64,
}

/// Result of getFile
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Present while the file is downloadable
    #[serde(default)]
    pub file_path: Option<String>,
}

/// An incoming update from getUpdates
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice: Option<Voice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Configuration for Telegram client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Bot API root (default: https://api.telegram.org)
    #[serde(default)]
    pub api_base: Option<String>,

    /// Long-poll timeout for getUpdates, in seconds (default: 30)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: None,
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl TelegramClient {
    /// Create a new Telegram client
    pub fn new(bot_token: String) -> Self {
        Self::with_api_base(bot_token, DEFAULT_API_BASE.to_string())
    }

    pub fn with_api_base(bot_token: String, api_base: String) -> Self {
        Self {
            bot_token,
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create from config; fails when no token is configured
    pub fn from_config(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .clone()
            .context("Telegram bot token is not configured (set TELEGRAM_BOT_TOKEN)")?;
        Ok(match &config.api_base {
            Some(base) => Self::with_api_base(token, base.clone()),
            None => Self::new(token),
        })
    }

    /// Build API URL
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Build file download URL
    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.bot_token, file_path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let mut request = self.client.post(self.api_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call Telegram {}", method))?;

        let result: TelegramResponse<T> = response
            .json()
            .await
            .context("Failed to parse Telegram response")?;

        if !result.ok {
            anyhow::bail!(
                "Telegram API error: {}",
                result.description.unwrap_or_default()
            );
        }

        result
            .result
            .with_context(|| format!("Telegram {} returned no result", method))
    }

    /// Send a text message, optionally as a reply
    pub async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<i64> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(reply_to) = reply_to {
            body["reply_to_message_id"] = reply_to.into();
            body["allow_sending_without_reply"] = true.into();
        }

        let result: MessageResult = self.call("sendMessage", &body, None).await?;
        Ok(result.message_id)
    }

    /// Resolve a file id to a downloadable path
    pub async fn get_file(&self, file_id: &str) -> Result<TelegramFile> {
        self.call("getFile", &serde_json::json!({ "file_id": file_id }), None)
            .await
    }

    /// Download the bytes behind a file id
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file = self.get_file(file_id).await?;
        let path = file
            .file_path
            .with_context(|| format!("File {} is not downloadable", file_id))?;

        let response = self
            .client
            .get(self.file_url(&path))
            .send()
            .await
            .context("Failed to download file")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("File download failed: status={}", status);
        }

        let bytes = response.bytes().await.context("Failed to read file body")?;
        Ok(bytes.to_vec())
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> Result<Vec<Update>> {
        let mut body = serde_json::json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            body["offset"] = offset.into();
        }

        // The HTTP timeout must outlast the server-side long poll.
        let http_timeout = Duration::from_secs(timeout_secs + 10);
        self.call("getUpdates", &body, Some(http_timeout)).await
    }
}

#[async_trait]
impl AudioSource for TelegramClient {
    async fn fetch(&self, file_ref: &str) -> Result<Vec<u8>> {
        self.download_file(file_ref).await
    }
}

#[async_trait]
impl Notifier for TelegramClient {
    fn max_message_chars(&self) -> usize {
        MAX_MESSAGE_CHARS
    }

    async fn deliver(&self, chat_id: i64, reply_to: Option<i64>, text: &str) -> Result<()> {
        self.send_message(chat_id, text, reply_to).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        let client = TelegramClient::new("TOKEN".to_string());
        assert_eq!(
            client.api_url("sendMessage"),
            "https://api.telegram.org/botTOKEN/sendMessage"
        );
        assert_eq!(
            client.file_url("voice/file_1.oga"),
            "https://api.telegram.org/file/botTOKEN/voice/file_1.oga"
        );
    }

    #[test]
    fn test_custom_api_base() {
        let client = TelegramClient::with_api_base("T".to_string(), "http://localhost:8081/".to_string());
        assert_eq!(client.api_url("getMe"), "http://localhost:8081/botT/getMe");
    }

    #[test]
    fn test_from_config_requires_token() {
        assert!(TelegramClient::from_config(&TelegramConfig::default()).is_err());
    }

    #[test]
    fn test_update_parsing() {
        let json = r#"{"update_id":10,"message":{"message_id":5,"chat":{"id":-100},
            "voice":{"file_id":"AwAD","duration":3,"mime_type":"audio/ogg","file_size":1234}}}"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let message = update.message.unwrap();
        assert_eq!(message.chat.id, -100);
        let voice = message.voice.unwrap();
        assert_eq!(voice.file_id, "AwAD");
        assert_eq!(voice.duration, 3);
        assert!(message.text.is_none());
    }
}
