//! Command-line interface for voxly.
//!
//! Long-running roles (`worker`, `bot`) plus operator commands for
//! inspecting and repairing tasks and the queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{self, ResolvedConfig};
use crate::domain::TaskStatus;
use crate::queue::SqliteQueue;
use crate::store::{SqliteKv, SqliteStore};

mod tasks;
mod worker;

/// voxly - voice message transcription pipeline
#[derive(Parser, Debug)]
#[command(name = "voxly")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: $VOXLY_CONFIG or .voxly/config.yaml)
    #[arg(long, global = true, env = "VOXLY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume the voice queue and transcribe messages
    Worker {
        /// Concurrent consumers (overrides worker.consumers)
        #[arg(short, long)]
        consumers: Option<usize>,

        /// Handle at most one message and exit
        #[arg(long)]
        once: bool,
    },

    /// Run the Telegram bot front-end
    Bot,

    /// Queue a voice message by hand
    Submit {
        chat_id: i64,
        message_id: i64,
        /// Telegram file id of the voice message
        file_id: String,

        /// Duration in seconds
        #[arg(long)]
        duration: Option<u32>,

        #[arg(long)]
        mime_type: Option<String>,
    },

    /// Show a task and its transcript
    Status {
        /// Task ID (UUID)
        task_id: String,
    },

    /// List tasks
    Tasks {
        /// Filter by status (queued, in_progress, done, failed)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Maximum number of tasks to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Put a failed task back on the queue
    Requeue {
        /// Task ID (UUID)
        task_id: String,
    },

    /// Republish queued or in-progress tasks that have not moved
    Recover {
        /// Only tasks untouched for this many minutes
        #[arg(long, default_value = "30")]
        older_than_mins: i64,

        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Show queue depth and dead letters
    Queue {
        /// Dead letters to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (secrets masked)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::config(self.config.as_deref())?;

        match self.command {
            Commands::Worker { consumers, once } => worker::run_worker(config, consumers, once).await,
            Commands::Bot => worker::run_bot(config).await,
            Commands::Submit {
                chat_id,
                message_id,
                file_id,
                duration,
                mime_type,
            } => tasks::submit(config, chat_id, message_id, file_id, duration, mime_type).await,
            Commands::Status { task_id } => tasks::show_status(config, &task_id).await,
            Commands::Tasks { status, limit } => tasks::list_tasks(config, status, limit).await,
            Commands::Requeue { task_id } => tasks::requeue(config, &task_id).await,
            Commands::Recover {
                older_than_mins,
                limit,
            } => tasks::recover(config, older_than_mins, limit).await,
            Commands::Queue { limit } => tasks::show_queue(config, limit).await,
            Commands::Config => {
                println!("{}", config);
                Ok(())
            }
        }
    }
}

/// Durable state shared by every role
pub(crate) struct Storage {
    pub store: Arc<SqliteStore>,
    pub queue: Arc<SqliteQueue>,
    pub kv: Arc<SqliteKv>,
}

impl Storage {
    pub fn open(config: &ResolvedConfig) -> Result<Self> {
        let path = &config.database;
        let store = SqliteStore::open(path)
            .with_context(|| format!("Failed to open task store: {}", path.display()))?;
        let queue = SqliteQueue::open(path)
            .with_context(|| format!("Failed to open queue: {}", path.display()))?
            .with_lease(config.lease());
        let kv = SqliteKv::open(path)
            .with_context(|| format!("Failed to open key-value store: {}", path.display()))?;

        Ok(Self {
            store: Arc::new(store),
            queue: Arc::new(queue),
            kv: Arc::new(kv),
        })
    }
}

/// Token cancelled on Ctrl+C
pub(crate) fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown requested");
        trigger.cancel();
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_worker() {
        let cli = Cli::try_parse_from(["voxly", "worker", "--consumers", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Worker {
                consumers: Some(3),
                once: false
            }
        ));
    }

    #[test]
    fn test_cli_parses_task_filter() {
        let cli = Cli::try_parse_from(["voxly", "--config", "/tmp/c.yaml", "tasks", "-s", "failed"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert!(matches!(
            cli.command,
            Commands::Tasks {
                status: Some(TaskStatus::Failed),
                limit: 20
            }
        ));

        assert!(Cli::try_parse_from(["voxly", "tasks", "-s", "lost"]).is_err());
    }
}
