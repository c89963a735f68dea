//! Operator commands: inspect and repair tasks and the queue.

use anyhow::{Context, Result};
use uuid::Uuid;

use super::Storage;
use crate::config::ResolvedConfig;
use crate::domain::{SourceRef, Task, TaskMeta, TaskStatus};
use crate::ingest::{Producer, ResubmitResult, SubmitResult, VoiceSubmission};
use crate::store::TaskStore;

fn parse_task_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid task ID: {}", raw))
}

fn producer(config: &ResolvedConfig, storage: &Storage) -> Producer {
    Producer::new(
        storage.store.clone(),
        storage.queue.clone(),
        config.queue.name.clone(),
        config.pipeline.retry_ceiling,
    )
}

pub(super) async fn submit(
    config: &ResolvedConfig,
    chat_id: i64,
    message_id: i64,
    file_id: String,
    duration: Option<u32>,
    mime_type: Option<String>,
) -> Result<()> {
    let storage = Storage::open(config)?;
    let result = producer(config, &storage)
        .submit(VoiceSubmission {
            source: SourceRef::new(chat_id, message_id),
            file_id,
            meta: TaskMeta {
                duration_secs: duration,
                mime_type,
                ..Default::default()
            },
        })
        .await?;

    match result {
        SubmitResult::Queued(id) => println!("Queued task {}", id),
        SubmitResult::AlreadyQueued(id) => println!("Already queued as task {}", id),
        SubmitResult::AlreadyProcessed(id) => println!("Already processed as task {}", id),
        SubmitResult::AlreadyFailed(id) => {
            println!("Task {} already failed; use `voxly requeue {}` to retry", id, id)
        }
    }
    Ok(())
}

pub(super) async fn show_status(config: &ResolvedConfig, raw_id: &str) -> Result<()> {
    let id = parse_task_id(raw_id)?;
    let storage = Storage::open(config)?;
    let task = storage
        .store
        .get(id)
        .await?
        .with_context(|| format!("Task not found: {}", id))?;

    println!("Task ID:    {}", task.id);
    println!("Source:     {}", task.source);
    println!("File:       {}", task.file_id);
    println!("Status:     {}", task.status);
    println!("Attempts:   {}/{}", task.attempts, config.pipeline.retry_ceiling);
    if let Some(op) = &task.operation_id {
        println!("Operation:  {}", op);
    }
    if let Some(err) = &task.error_text {
        println!("Error:      {}", err);
    }
    if let Some(duration) = task.meta.duration_secs {
        println!("Duration:   {}s", duration);
    }
    println!("Created:    {}", task.created_at);
    println!("Updated:    {}", task.updated_at);

    if let Some(transcript) = storage.store.transcript(task.id).await? {
        println!("\nTranscript:\n{}", transcript.text);
    }

    Ok(())
}

pub(super) async fn list_tasks(config: &ResolvedConfig, status: Option<TaskStatus>, limit: usize) -> Result<()> {
    let storage = Storage::open(config)?;

    let mut tasks: Vec<Task> = Vec::new();
    match status {
        Some(status) => tasks = storage.store.list_by_status(status, limit).await?,
        None => {
            for status in TaskStatus::ALL {
                tasks.extend(storage.store.list_by_status(status, usize::MAX).await?);
            }
            tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at));
            tasks.truncate(limit);
        }
    }

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<24} {:<8}", "TASK ID", "STATUS", "SOURCE", "ATTEMPTS");
    println!("{}", "-".repeat(84));
    for task in tasks {
        println!(
            "{:<38} {:<12} {:<24} {:<8}",
            task.id,
            task.status.as_str(),
            task.source.to_string(),
            task.attempts
        );
    }

    let counts = storage.store.counts()?;
    let summary: Vec<String> = counts
        .iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect();
    println!("\n{}", summary.join(", "));

    Ok(())
}

pub(super) async fn requeue(config: &ResolvedConfig, raw_id: &str) -> Result<()> {
    let id = parse_task_id(raw_id)?;
    let storage = Storage::open(config)?;

    match producer(config, &storage).resubmit(id).await? {
        ResubmitResult::Requeued(id) => println!("Requeued task {}", id),
        ResubmitResult::Exhausted { attempts } => {
            anyhow::bail!("Task {} has used all {} attempts", id, attempts)
        }
        ResubmitResult::NotFailed(status) => {
            anyhow::bail!("Task {} is {}; only failed tasks can be requeued", id, status)
        }
    }
    Ok(())
}

pub(super) async fn recover(config: &ResolvedConfig, older_than_mins: i64, limit: usize) -> Result<()> {
    if older_than_mins < 0 {
        anyhow::bail!("--older-than-mins must not be negative");
    }
    let storage = Storage::open(config)?;
    let republished = producer(config, &storage)
        .recover_stale(chrono::Duration::minutes(older_than_mins), limit)
        .await?;

    if republished.is_empty() {
        println!("No stale tasks");
    } else {
        for id in &republished {
            println!("Republished {}", id);
        }
        println!("\n{} task(s) republished", republished.len());
    }
    Ok(())
}

pub(super) async fn show_queue(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let storage = Storage::open(config)?;
    let queue = &config.queue.name;
    let depth = storage.queue.depth(queue)?;

    println!("Queue: {}", queue);
    println!("  Ready:      {}", depth.ready);
    println!("  In flight:  {}", depth.in_flight);
    println!("  Dead:       {}", depth.dead);

    let dead = storage.queue.dead_letters(queue, limit)?;
    if !dead.is_empty() {
        println!("\nDead letters:");
        for (id, reason) in dead {
            println!("  #{} {}", id, reason.as_deref().unwrap_or("(no reason)"));
        }
    }
    Ok(())
}
