//! Ingress: how voice messages become queued tasks.
//!
//! 1. **Bot**: long-polls the chat platform, handles /start and /stop
//! 2. **Activation**: per-chat on/off flag with expiry
//! 3. **Producer**: idempotent task creation + queue publish
//!
//! # Architecture
//!
//! ```text
//! Telegram → Bot → Producer → Task Store
//!                     ↓
//!                   Queue → Orchestrator (worker)
//! ```

pub mod activation;
pub mod bot;
pub mod producer;

// Re-export key types
pub use activation::{activation_key, ChatActivation, ACTIVATION_TTL};
pub use bot::{BotFrontend, Command};
pub use producer::{IngestError, Producer, ResubmitResult, SubmitResult, VoiceSubmission};
