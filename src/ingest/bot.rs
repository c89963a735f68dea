//! Chat front-end: long-polls Telegram, handles commands, submits voice
//! messages from active chats.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::activation::ChatActivation;
use super::producer::{Producer, SubmitResult, VoiceSubmission};
use crate::adapters::telegram::{Message, Voice};
use crate::adapters::{Notifier, TelegramClient};
use crate::domain::{SourceRef, TaskMeta};
use crate::resilience::sleep_or_cancel;

const STARTED_TEXT: &str = "Transcription is on. Send a voice message and I'll reply with its text.\nSend /stop to turn it off.";
const STOPPED_TEXT: &str = "Transcription is off.\nSend /start to turn it back on.";
const HELP_TEXT: &str = "/start: transcribe voice messages in this chat\n/stop: stop transcribing";
const ACCEPTED_TEXT: &str = "Processing...";
const SUBMIT_FAILED_TEXT: &str = "Could not queue this voice message, please try again later.";

/// Pause after a failed getUpdates call
const UPDATE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Bot commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Help,
}

impl Command {
    /// Parse `/start`, `/stop@my_bot`, ...; `None` for plain text or
    /// unknown commands
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.trim().split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "help" => Some(Self::Help),
            _ => None,
        }
    }
}

pub struct BotFrontend {
    telegram: Arc<TelegramClient>,
    notifier: Arc<dyn Notifier>,
    producer: Arc<Producer>,
    activation: ChatActivation,
    poll_timeout_secs: u64,
}

impl BotFrontend {
    pub fn new(
        telegram: Arc<TelegramClient>,
        producer: Arc<Producer>,
        activation: ChatActivation,
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            notifier: telegram.clone(),
            telegram,
            producer,
            activation,
            poll_timeout_secs,
        }
    }

    /// Send replies through `notifier` instead of the Telegram client
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Poll for updates until `shutdown` fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut offset: Option<i64> = None;
        info!("Bot started");

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.telegram.get_updates(offset, self.poll_timeout_secs) => polled,
            };

            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        if let Some(message) = update.message {
                            self.handle_message(&message).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Failed to fetch updates");
                    if sleep_or_cancel(UPDATE_ERROR_BACKOFF, &shutdown).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Bot stopped");
    }

    async fn reply(&self, message: &Message, text: &str) {
        if let Err(e) = self
            .notifier
            .deliver(message.chat.id, Some(message.message_id), text)
            .await
        {
            warn!(chat_id = message.chat.id, error = %e, "Failed to send reply");
        }
    }

    /// React to one incoming message
    pub async fn handle_message(&self, message: &Message) {
        if let Some(voice) = &message.voice {
            self.handle_voice(message, voice).await;
            return;
        }

        let Some(command) = message.text.as_deref().and_then(Command::parse) else {
            return;
        };
        let chat_id = message.chat.id;

        match command {
            Command::Start => match self.activation.activate(chat_id).await {
                Ok(()) => {
                    info!(chat_id, "Chat activated");
                    self.reply(message, STARTED_TEXT).await;
                }
                Err(e) => error!(chat_id, error = %e, "Failed to activate chat"),
            },
            Command::Stop => match self.activation.deactivate(chat_id).await {
                Ok(_) => {
                    info!(chat_id, "Chat deactivated");
                    self.reply(message, STOPPED_TEXT).await;
                }
                Err(e) => error!(chat_id, error = %e, "Failed to deactivate chat"),
            },
            Command::Help => self.reply(message, HELP_TEXT).await,
        }
    }

    async fn handle_voice(&self, message: &Message, voice: &Voice) {
        let chat_id = message.chat.id;
        if !self.activation.is_active(chat_id).await {
            debug!(chat_id, message_id = message.message_id, "Ignoring voice message from inactive chat");
            return;
        }

        let submission = VoiceSubmission {
            source: SourceRef::new(chat_id, message.message_id),
            file_id: voice.file_id.clone(),
            meta: TaskMeta {
                duration_secs: Some(voice.duration),
                file_size: voice.file_size,
                mime_type: voice.mime_type.clone(),
                ..Default::default()
            },
        };

        match self.producer.submit(submission).await {
            Ok(SubmitResult::Queued(task_id)) => {
                info!(chat_id, %task_id, "Voice message queued");
                self.reply(message, ACCEPTED_TEXT).await;
            }
            Ok(existing) => {
                debug!(chat_id, task_id = %existing.id(), "Voice message already submitted");
            }
            Err(e) => {
                error!(chat_id, error = %e, "Failed to submit voice message");
                self.reply(message, SUBMIT_FAILED_TEXT).await;
            }
        }
    }
}
