//! Token-bucket rate limiter with lazy refill.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{sleep_or_cancel, Cancelled};

/// Configuration for a [`RateLimiter`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Bucket size; also the initial token count (default: 10)
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Tokens added per interval (default: 10)
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Refill interval in milliseconds (default: 1000)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_capacity() -> u32 {
    10
}
fn default_rate() -> u32 {
    10
}
fn default_interval_ms() -> u64 {
    1000
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            rate: default_rate(),
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket: `capacity` tokens, `rate` tokens restored every `interval`
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    rate: u32,
    interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket
    pub fn new(capacity: u32, rate: u32, interval: Duration) -> Self {
        Self {
            capacity,
            rate,
            interval: interval.max(Duration::from_millis(1)),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(
            settings.capacity,
            settings.rate,
            Duration::from_millis(settings.interval_ms),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed();
        let periods = elapsed.as_nanos() / self.interval.as_nanos();
        if periods == 0 || self.rate == 0 {
            return;
        }

        let added = periods.saturating_mul(self.rate as u128);
        let tokens = (bucket.tokens as u128).saturating_add(added);
        if tokens >= self.capacity as u128 {
            bucket.tokens = self.capacity;
            bucket.last_refill = Instant::now();
        } else {
            // periods * rate < capacity here, so the cast cannot truncate
            bucket.tokens = tokens as u32;
            bucket.last_refill += self.interval * periods as u32;
        }
    }

    /// Take a token if one is available
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently available
    pub fn available(&self) -> u32 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Wait until a token is available, checking once per interval.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if self.try_acquire() {
                return Ok(());
            }
            sleep_or_cancel(self.interval, cancel).await?;
        }
    }
}
