//! Resilience primitives guarding calls to external collaborators.
//!
//! - [`CircuitBreaker`]: fail fast while a dependency is known to be down
//! - [`retry_with_backoff`]: bounded retries with exponential, capped delays
//! - [`RateLimiter`]: token bucket for outbound request rates
//!
//! Every wait performed here observes a [`CancellationToken`] so a shutdown
//! request interrupts sleeps immediately.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use circuit_breaker::{BreakerError, BreakerSettings, CircuitBreaker, CircuitState};
pub use rate_limiter::{RateLimitSettings, RateLimiter};
pub use retry::{retry_with_backoff, RetryConfig, RetryError};

/// Returned when a wait was interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
