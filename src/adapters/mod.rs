//! Capability interfaces for external systems, plus their HTTP clients.
//!
//! The pipeline talks to four collaborators and knows nothing about their
//! wire formats:
//! - [`AudioSource`]: download audio by opaque file reference
//! - [`BlobStore`]: store bytes under a key, get back a fetchable URI
//! - [`Recognizer`]: long-running speech recognition
//! - [`Notifier`]: reply to the originator of a voice message

pub mod blob;
pub mod recognizer;
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

pub use blob::{content_type_for, object_key, FsBlobStore, HttpBlobStore, StorageSettings};
pub use recognizer::{
    wait_for_result, HttpRecognizer, OperationStatus, PollSettings, RecognitionResult,
    RecognizerSettings, WaitError,
};
pub use telegram::{TelegramClient, TelegramConfig};

/// Downloads audio content
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Fetch the bytes behind `file_ref`
    async fn fetch(&self, file_ref: &str) -> Result<Vec<u8>>;
}

/// Stores uploaded objects
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str {
        "blob"
    }

    /// Store `bytes` under `key`; returns a URI the recognizer can read
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String>;
}

/// Long-running speech recognition
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str {
        "recognizer"
    }

    /// Start recognition of the audio at `audio_uri`; returns an operation id
    async fn start_recognition(&self, audio_uri: &str) -> Result<String>;

    /// Check the state of a started operation once
    async fn poll_operation(&self, operation_id: &str) -> Result<OperationStatus>;
}

/// Sends text back to a chat
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Longest text a single `deliver` call accepts
    fn max_message_chars(&self) -> usize {
        usize::MAX
    }

    /// Deliver `text` to `chat_id` as one message, threaded under `reply_to`
    /// when given. Longer texts are split by the caller with [`split_message`].
    async fn deliver(&self, chat_id: i64, reply_to: Option<i64>, text: &str) -> Result<()>;
}

/// Split `text` into pieces of at most `max_chars` characters, preferring
/// line breaks, then spaces, as cut points.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut parts = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..limit];
        let cut = if rest[limit..].starts_with(['\n', ' ']) {
            limit
        } else {
            window
                .rfind('\n')
                .or_else(|| window.rfind(' '))
                .filter(|&i| i > 0)
                .unwrap_or(limit)
        };

        parts.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
    }

    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_short_message() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn test_split_prefers_whitespace() {
        let parts = split_message("aaaa bbbb cccc", 9);
        assert_eq!(parts, vec!["aaaa bbbb", "cccc"]);
        for part in &parts {
            assert!(part.chars().count() <= 9);
        }
    }

    #[test]
    fn test_split_counts_characters_not_bytes() {
        let text = "привет".repeat(3);
        let parts = split_message(&text, 6);
        assert_eq!(parts, vec!["привет", "привет", "привет"]);
    }
}

