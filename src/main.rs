//! voxly CLI entrypoint
//!
//! One binary, two long-running roles sharing one SQLite database:
//! - `voxly bot` long-polls Telegram. It activates chats on command and turns
//!   each voice message from an active chat into a queued task.
//! - `voxly worker` consumes the voice queue. Each message is downloaded,
//!   stored, recognized and the transcript is replied to the originating chat.
//!
//! The remaining subcommands inspect and repair tasks and the queue.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use voxly::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Parse and execute CLI
    let cli = Cli::parse();
    cli.execute().await
}
