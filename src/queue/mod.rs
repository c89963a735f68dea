//! At-least-once message queue and its consumer loop.
//!
//! A message is delivered, handled, then settled:
//! - ack removes it
//! - nack returns it for redelivery (optionally delayed)
//! - reject moves it to the dead state
//!
//! A delivery that is never settled becomes visible again once its lease
//! expires, so a crashed consumer loses nothing. The consumer renews the
//! lease while its handler runs.

pub mod consumer;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use consumer::{ConsumeStats, Consumer, ConsumerConfig};
pub use sqlite::{QueueDepth, SqliteQueue};

/// Errors from queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The delivery was redelivered elsewhere or already settled
    #[error("Lease lost for message {0}")]
    LeaseLost(i64),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// A leased message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub queue: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Durable queue capability
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append a message; returns its id
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<i64, QueueError>;

    /// Lease the next available message, if any
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    /// Push the lease of a delivery still being handled forward by a full
    /// lease period. Fails with `LeaseLost` once it was redelivered or settled.
    async fn extend_lease(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Remove a handled message
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a message for redelivery after `delay`
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Park a message that must not be redelivered
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

/// How a handler wants its delivery settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; remove the message
    Ack,

    /// Not handled; deliver again after `delay`
    Requeue { delay: Duration },

    /// Never deliver again
    Reject { reason: String },
}

/// Processes one message payload at a time.
///
/// Handlers report failure through the returned [`Disposition`]; they never
/// abort the consumer loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], shutdown: &CancellationToken) -> Disposition;
}
