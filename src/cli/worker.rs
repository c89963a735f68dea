//! Long-running roles: queue worker and bot front-end.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use super::{shutdown_on_ctrl_c, Storage};
use crate::adapters::{HttpRecognizer, TelegramClient};
use crate::config::ResolvedConfig;
use crate::core::{Collaborators, Orchestrator};
use crate::ingest::{BotFrontend, ChatActivation, Producer};
use crate::queue::{ConsumeStats, Consumer, Disposition};

/// Run `consumers` consumers against one orchestrator until Ctrl+C.
///
/// The consumers share the orchestrator, so the circuit breaker and rate
/// limiter are process-wide.
pub(super) async fn run_worker(config: &ResolvedConfig, consumers: Option<usize>, once: bool) -> Result<()> {
    let consumers = consumers.unwrap_or(config.worker.consumers);
    if consumers == 0 {
        anyhow::bail!("--consumers must be at least 1");
    }

    let storage = Storage::open(config)?;
    let telegram = Arc::new(TelegramClient::from_config(&config.telegram)?);
    let recognizer = Arc::new(HttpRecognizer::new(config.recognizer.clone())?);
    let blobs = config
        .storage
        .build()
        .context("Failed to set up blob storage")?;

    let orchestrator = Arc::new(Orchestrator::new(
        Collaborators {
            store: storage.store.clone(),
            audio: telegram.clone(),
            blobs,
            recognizer,
            notifier: telegram,
        },
        config.pipeline.clone(),
    ));

    let shutdown = shutdown_on_ctrl_c();

    if once {
        let consumer = Consumer::new(storage.queue.clone(), orchestrator, config.consumer_config());
        match consumer.run_once(&shutdown).await? {
            Some(Disposition::Ack) => println!("Message handled"),
            Some(Disposition::Requeue { delay }) => println!("Message requeued (retry in {:?})", delay),
            Some(Disposition::Reject { reason }) => println!("Message dead-lettered: {}", reason),
            None => println!("Queue is empty"),
        }
        return Ok(());
    }

    info!(consumers, queue = %config.queue.name, "Worker starting");

    let mut handles = Vec::with_capacity(consumers);
    for _ in 0..consumers {
        let consumer = Consumer::new(storage.queue.clone(), orchestrator.clone(), config.consumer_config());
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { consumer.run(token).await }));
    }

    let mut total = ConsumeStats::default();
    for handle in handles {
        match handle.await {
            Ok(stats) => {
                total.acked += stats.acked;
                total.requeued += stats.requeued;
                total.rejected += stats.rejected;
                total.errors += stats.errors;
            }
            Err(e) => error!(error = %e, "Consumer task panicked"),
        }
    }

    println!(
        "Worker stopped: {} acked, {} requeued, {} dead-lettered, {} queue errors",
        total.acked, total.requeued, total.rejected, total.errors
    );
    Ok(())
}

/// Run the bot front-end until Ctrl+C
pub(super) async fn run_bot(config: &ResolvedConfig) -> Result<()> {
    let storage = Storage::open(config)?;
    let telegram = Arc::new(TelegramClient::from_config(&config.telegram)?);
    let producer = Arc::new(Producer::new(
        storage.store.clone(),
        storage.queue.clone(),
        config.queue.name.clone(),
        config.pipeline.retry_ceiling,
    ));
    let activation = ChatActivation::new(storage.kv.clone());

    let bot = BotFrontend::new(telegram, producer, activation, config.telegram.poll_timeout_secs);
    bot.run(shutdown_on_ctrl_c()).await;
    Ok(())
}
