//! Circuit breaker for an unreliable dependency.
//!
//! Closed: calls pass through and consecutive failures are counted.
//! Open: calls fail immediately with [`BreakerError::Open`] until the cooldown
//! since the last failure has elapsed.
//! Half-open: exactly one trial call is let through; its outcome closes or
//! re-opens the breaker.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

/// Configuration for a [`CircuitBreaker`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker (default: 5)
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Seconds to stay open before allowing a trial call (default: 60)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_max_failures() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    60
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Error from a call routed through the breaker
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without invoking it
    Open,
    /// The call ran and failed
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "circuit breaker is open"),
            Self::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open => None,
            Self::Inner(e) => Some(e),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_started: Option<Instant>,
}

/// Thread-safe circuit breaker, shared by reference or `Arc`
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker. `max_failures` below 1 is treated as 1.
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                trial_started: None,
            }),
        }
    }

    pub fn from_settings(settings: &BreakerSettings) -> Self {
        Self::new(settings.max_failures, Duration::from_secs(settings.cooldown_secs))
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded since the last success
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Force the breaker closed and clear the failure count
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.trial_started = None;
    }

    /// Decide whether a call may proceed, moving Open to HalfOpen once the
    /// cooldown has elapsed.
    fn admit(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                    info!("Circuit breaker half-open, admitting trial call");
                }
                cooled
            }
            CircuitState::HalfOpen => {
                // A trial abandoned by its caller must not wedge the breaker.
                let stale = inner
                    .trial_started
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if stale {
                    inner.trial_started = Some(Instant::now());
                }
                stale
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.trial_started = None;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_started = None;

        let reopen = inner.state == CircuitState::HalfOpen;
        if reopen || inner.failures >= self.max_failures {
            if inner.state != CircuitState::Open {
                warn!(
                    failures = inner.failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "Circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] without invoking `op` while the breaker
    /// is open or a half-open trial is already in flight.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            return Err(BreakerError::Open);
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }
}
