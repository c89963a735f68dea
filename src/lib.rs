//! voxly - Voice message transcription pipeline
//!
//! Voice messages arrive through a chat bot, become durable tasks, and are
//! processed asynchronously: download, upload to blob storage, speech
//! recognition, and a reply with the transcript.
//!
//! # Architecture
//!
//! Work flows through an at-least-once queue:
//! - The bot submits a task per voice message (idempotent on the source)
//! - Workers consume queue messages and run one processing cycle each
//! - Task state lives in the store; queue messages only point at tasks
//!
//! # Modules
//!
//! - `resilience`: Retry with backoff, circuit breaker, rate limiter
//! - `domain`: Task state machine, transcripts, queue messages
//! - `store`: Task and key-value persistence (SQLite)
//! - `queue`: Durable message queue and consumer loop
//! - `adapters`: Telegram, blob storage, speech recognizer
//! - `core`: The processing orchestrator
//! - `ingest`: Bot front-end, chat activation, producer
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the bot and a worker
//! voxly bot &
//! voxly worker --consumers 2
//!
//! # Inspect a task
//! voxly status <task-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod queue;
pub mod resilience;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, PipelineSettings};
pub use domain::{QueueMessage, SourceRef, Task, TaskStatus, Transcript};
pub use ingest::{BotFrontend, ChatActivation, Producer, SubmitResult};
pub use queue::{Consumer, Disposition, MessageQueue, SqliteQueue};
pub use resilience::{CircuitBreaker, RateLimiter, RetryConfig};
pub use store::{KeyValueStore, SqliteKv, SqliteStore, TaskStore};

// Telegram integration
pub use adapters::{TelegramClient, TelegramConfig};
