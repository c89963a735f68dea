//! Domain types for the transcription pipeline.
//!
//! - Task: one voice message and its processing lifecycle
//! - Transcript: recognized text for a finished task
//! - QueueMessage: what travels through the queue

pub mod message;
pub mod task;
pub mod transcript;

pub use message::{QueueMessage, VOICE_QUEUE};
pub use task::{SourceRef, Task, TaskMeta, TaskStatus, TransitionError, MAX_ATTEMPTS};
pub use transcript::Transcript;
