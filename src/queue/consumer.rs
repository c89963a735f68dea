//! Consumer loop: one message in flight at a time (prefetch 1).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{Delivery, Disposition, MessageHandler, MessageQueue, QueueError};
use crate::resilience::sleep_or_cancel;

/// Consumer loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Queue to consume (default: voice_processing)
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Pause between polls when the queue is empty, in milliseconds (default: 500)
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Lease renewal period while a message is being handled, in
    /// milliseconds (default: 300000, a third of the default lease)
    #[serde(default = "default_lease_renew_ms")]
    pub lease_renew_ms: u64,
}

fn default_queue() -> String {
    crate::domain::VOICE_QUEUE.to_string()
}
fn default_idle_poll_ms() -> u64 {
    500
}
fn default_lease_renew_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            idle_poll_ms: default_idle_poll_ms(),
            lease_renew_ms: default_lease_renew_ms(),
        }
    }
}

/// Counters for one consumer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    /// Queue operations that failed (receive or settle)
    pub errors: u64,
}

/// Pulls messages from a queue and hands them to a handler
pub struct Consumer {
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(queue: Arc<dyn MessageQueue>, handler: Arc<dyn MessageHandler>, config: ConsumerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.config.idle_poll_ms)
    }

    fn lease_renewal(&self) -> Duration {
        Duration::from_millis(self.config.lease_renew_ms.max(1))
    }

    /// Consume until `shutdown` fires.
    ///
    /// A message already being handled when shutdown fires is settled with
    /// whatever disposition the handler returns; no new message is taken.
    #[instrument(skip(self, shutdown), fields(queue = %self.config.queue))]
    pub async fn run(&self, shutdown: CancellationToken) -> ConsumeStats {
        let mut stats = ConsumeStats::default();
        info!("Consumer started");

        while !shutdown.is_cancelled() {
            match self.queue.receive(&self.config.queue).await {
                Ok(Some(delivery)) => {
                    self.process(delivery, &shutdown, &mut stats).await;
                }
                Ok(None) => {
                    if sleep_or_cancel(self.idle_poll(), &shutdown).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(error = %e, "Failed to receive from queue");
                    if sleep_or_cancel(self.idle_poll(), &shutdown).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            acked = stats.acked,
            requeued = stats.requeued,
            rejected = stats.rejected,
            errors = stats.errors,
            "Consumer stopped"
        );
        stats
    }

    /// Handle at most one available message.
    ///
    /// Returns the disposition applied, or `None` when the queue was empty.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<Option<Disposition>, QueueError> {
        let Some(delivery) = self.queue.receive(&self.config.queue).await? else {
            return Ok(None);
        };
        let disposition = self.handle(&delivery, shutdown).await;
        self.settle(&delivery, &disposition).await?;
        Ok(Some(disposition))
    }

    async fn process(&self, delivery: Delivery, shutdown: &CancellationToken, stats: &mut ConsumeStats) {
        debug!(
            message_id = delivery.id,
            delivery_count = delivery.delivery_count,
            "Received message"
        );

        let disposition = self.handle(&delivery, shutdown).await;
        match self.settle(&delivery, &disposition).await {
            Ok(()) => match disposition {
                Disposition::Ack => stats.acked += 1,
                Disposition::Requeue { .. } => stats.requeued += 1,
                Disposition::Reject { .. } => stats.rejected += 1,
            },
            Err(e) => {
                stats.errors += 1;
                warn!(message_id = delivery.id, error = %e, "Failed to settle message");
            }
        }
    }

    /// Run the handler, renewing the delivery's lease until it returns
    async fn handle(&self, delivery: &Delivery, shutdown: &CancellationToken) -> Disposition {
        let handling = self.handler.handle(&delivery.payload, shutdown);
        tokio::pin!(handling);

        let period = self.lease_renewal();
        let mut renewal = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                disposition = &mut handling => return disposition,
                _ = renewal.tick() => {
                    match self.queue.extend_lease(delivery).await {
                        Ok(()) => debug!(message_id = delivery.id, "Lease renewed"),
                        Err(e) => warn!(message_id = delivery.id, error = %e, "Failed to renew lease"),
                    }
                }
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, disposition: &Disposition) -> Result<(), QueueError> {
        match disposition {
            Disposition::Ack => self.queue.ack(delivery).await,
            Disposition::Requeue { delay } => self.queue.nack(delivery, *delay).await,
            Disposition::Reject { reason } => self.queue.reject(delivery, reason).await,
        }
    }
}
