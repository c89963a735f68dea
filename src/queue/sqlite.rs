//! SQLite-backed durable queue.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use super::{Delivery, MessageQueue, QueueError};
use crate::store::open_connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_messages (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    queue            TEXT NOT NULL,
    payload          BLOB NOT NULL,
    state            TEXT NOT NULL DEFAULT 'ready',
    delivery_count   INTEGER NOT NULL DEFAULT 0,
    available_at     INTEGER NOT NULL,
    lease_expires_at INTEGER,
    last_error       TEXT,
    published_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_messages (queue, state, available_at);
";

/// Default visibility lease for a received message
pub const DEFAULT_LEASE: Duration = Duration::from_secs(15 * 60);

/// Message counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub in_flight: u64,
    pub dead: u64,
}

pub struct SqliteQueue {
    conn: Mutex<Connection>,
    lease: Duration,
}

impl SqliteQueue {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        Self::init(open_connection(Some(path))?)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(open_connection(None)?)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lease: DEFAULT_LEASE,
        })
    }

    /// How long a received message stays invisible to other consumers
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError> {
        let conn = self.lock();
        let now = now_millis();
        let (ready, in_flight, dead): (i64, i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN state = 'ready'
                                    OR (state = 'inflight' AND lease_expires_at <= ?2) THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'inflight' AND lease_expires_at > ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END), 0)
             FROM queue_messages WHERE queue = ?1",
            params![queue, now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(QueueDepth {
            ready: ready.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
            dead: dead.max(0) as u64,
        })
    }

    /// Dead messages with their rejection reasons, oldest first
    pub fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<(i64, Option<String>)>, QueueError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, last_error FROM queue_messages
             WHERE queue = ?1 AND state = 'dead' ORDER BY id LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![queue, limit], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<i64, QueueError> {
        let conn = self.lock();
        let now = now_millis();
        conn.execute(
            "INSERT INTO queue_messages (queue, payload, available_at, published_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![queue, payload, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();

        let next: Option<(i64, Vec<u8>, i64)> = tx
            .query_row(
                "SELECT id, payload, delivery_count FROM queue_messages
                 WHERE queue = ?1
                   AND ((state = 'ready' AND available_at <= ?2)
                        OR (state = 'inflight' AND lease_expires_at <= ?2))
                 ORDER BY available_at, id
                 LIMIT 1",
                params![queue, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id, payload, count)) = next else {
            return Ok(None);
        };

        let delivery_count = count.saturating_add(1);
        tx.execute(
            "UPDATE queue_messages
             SET state = 'inflight', delivery_count = ?2, lease_expires_at = ?3
             WHERE id = ?1",
            params![id, delivery_count, now.saturating_add(millis(self.lease))],
        )?;
        tx.commit()?;

        Ok(Some(Delivery {
            id,
            queue: queue.to_string(),
            payload,
            delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
        }))
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE queue_messages
             SET lease_expires_at = ?3
             WHERE id = ?1 AND state = 'inflight' AND delivery_count = ?2",
            params![
                delivery.id,
                delivery.delivery_count,
                now_millis().saturating_add(millis(self.lease))
            ],
        )?;
        if changed == 0 {
            return Err(QueueError::LeaseLost(delivery.id));
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM queue_messages
             WHERE id = ?1 AND state = 'inflight' AND delivery_count = ?2",
            params![delivery.id, delivery.delivery_count],
        )?;
        if removed == 0 {
            return Err(QueueError::LeaseLost(delivery.id));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE queue_messages
             SET state = 'ready', available_at = ?3, lease_expires_at = NULL
             WHERE id = ?1 AND state = 'inflight' AND delivery_count = ?2",
            params![
                delivery.id,
                delivery.delivery_count,
                now_millis().saturating_add(millis(delay))
            ],
        )?;
        if changed == 0 {
            return Err(QueueError::LeaseLost(delivery.id));
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE queue_messages
             SET state = 'dead', lease_expires_at = NULL, last_error = ?3
             WHERE id = ?1 AND state = 'inflight' AND delivery_count = ?2",
            params![delivery.id, delivery.delivery_count, reason],
        )?;
        if changed == 0 {
            return Err(QueueError::LeaseLost(delivery.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "voice_processing";

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        queue.publish(Q, b"first").await.unwrap();
        queue.publish(Q, b"second").await.unwrap();

        let d1 = queue.receive(Q).await.unwrap().unwrap();
        assert_eq!(d1.payload, b"first");
        assert_eq!(d1.delivery_count, 1);
        assert!(!d1.is_redelivery());

        let d2 = queue.receive(Q).await.unwrap().unwrap();
        assert_eq!(d2.payload, b"second");
        assert!(queue.receive(Q).await.unwrap().is_none());

        queue.ack(&d1).await.unwrap();
        queue.ack(&d2).await.unwrap();
        assert_eq!(queue.depth(Q).unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        queue.publish("other", b"x").await.unwrap();
        assert!(queue.receive(Q).await.unwrap().is_none());
        assert!(queue.receive("other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        queue.publish(Q, b"payload").await.unwrap();

        let first = queue.receive(Q).await.unwrap().unwrap();
        queue.nack(&first, Duration::ZERO).await.unwrap();

        let second = queue.receive(Q).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 2);
        assert!(second.is_redelivery());
    }

    #[tokio::test]
    async fn test_nack_delay_hides_message() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        queue.publish(Q, b"payload").await.unwrap();

        let delivery = queue.receive(Q).await.unwrap().unwrap();
        queue.nack(&delivery, Duration::from_secs(3600)).await.unwrap();

        assert!(queue.receive(Q).await.unwrap().is_none());
        assert_eq!(queue.depth(Q).unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered_and_fences_old_holder() {
        let queue = SqliteQueue::open_in_memory().unwrap().with_lease(Duration::ZERO);
        queue.publish(Q, b"payload").await.unwrap();

        let stale = queue.receive(Q).await.unwrap().unwrap();
        let fresh = queue.receive(Q).await.unwrap().unwrap();
        assert_eq!(fresh.id, stale.id);
        assert_eq!(fresh.delivery_count, 2);

        assert!(matches!(queue.ack(&stale).await, Err(QueueError::LeaseLost(_))));
        queue.ack(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_lease_keeps_message_hidden() {
        let queue = SqliteQueue::open_in_memory()
            .unwrap()
            .with_lease(Duration::from_millis(300));
        queue.publish(Q, b"payload").await.unwrap();

        let held = queue.receive(Q).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.extend_lease(&held).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // past the original deadline, inside the renewed one
        assert!(queue.receive(Q).await.unwrap().is_none());
        assert_eq!(queue.depth(Q).unwrap().in_flight, 1);
        queue.ack(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_lease_fails_after_redelivery() {
        let queue = SqliteQueue::open_in_memory().unwrap().with_lease(Duration::ZERO);
        queue.publish(Q, b"payload").await.unwrap();

        let stale = queue.receive(Q).await.unwrap().unwrap();
        let fresh = queue.receive(Q).await.unwrap().unwrap();

        assert!(matches!(
            queue.extend_lease(&stale).await,
            Err(QueueError::LeaseLost(_))
        ));
        queue.extend_lease(&fresh).await.unwrap();
        queue.ack(&fresh).await.unwrap();
        assert!(matches!(
            queue.extend_lease(&fresh).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_reject_moves_to_dead() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        queue.publish(Q, b"garbage").await.unwrap();

        let delivery = queue.receive(Q).await.unwrap().unwrap();
        queue.reject(&delivery, "undecodable payload").await.unwrap();

        assert!(queue.receive(Q).await.unwrap().is_none());
        assert_eq!(queue.depth(Q).unwrap().dead, 1);
        let dead = queue.dead_letters(Q, 10).unwrap();
        assert_eq!(dead, vec![(delivery.id, Some("undecodable payload".to_string()))]);
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let queue = SqliteQueue::open(&path).unwrap();
            queue.publish(Q, b"durable").await.unwrap();
            // received but never settled
            queue.receive(Q).await.unwrap().unwrap();
        }

        let queue = SqliteQueue::open(&path).unwrap();
        assert_eq!(queue.depth(Q).unwrap().in_flight, 1);
        assert!(queue.receive(Q).await.unwrap().is_none());
    }
}
