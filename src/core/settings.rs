//! Tunables for a processing cycle.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::PollSettings;
use crate::domain::MAX_ATTEMPTS;
use crate::resilience::{BreakerSettings, RateLimitSettings, RetryConfig};

/// Pipeline limits and resilience settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Failed cycles before a task is permanently failed (default: 3)
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Upper bound for the whole download step, retries included (default: 60)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Largest audio accepted, in bytes (default: 20MB)
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: u64,

    /// Retries for download, upload and delivery; also the requeue backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Breaker around recognition start
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Rate limit on recognition start
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Waiting for recognition to finish
    #[serde(default)]
    pub poll: PollSettings,

    /// Sent to the user when a task fails for good
    #[serde(default = "default_failure_message")]
    pub failure_message: String,
}

fn default_retry_ceiling() -> u32 {
    MAX_ATTEMPTS
}
fn default_fetch_timeout() -> u64 {
    60
}
fn default_max_audio_bytes() -> u64 {
    20 * 1024 * 1024
} // 20MB, the Bot API download limit
fn default_failure_message() -> String {
    "Sorry, this voice message could not be transcribed.".to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_audio_bytes: default_max_audio_bytes(),
            retry: RetryConfig::default(),
            breaker: BreakerSettings::default(),
            rate_limit: RateLimitSettings::default(),
            poll: PollSettings::default(),
            failure_message: default_failure_message(),
        }
    }
}

/// A setting that cannot work
#[derive(Debug, Error)]
#[error("Invalid setting {field}: {reason}")]
pub struct InvalidSetting {
    pub field: &'static str,
    pub reason: String,
}

impl PipelineSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Reject combinations that would stall or spin the pipeline
    pub fn validate(&self) -> Result<(), InvalidSetting> {
        let invalid = |field, reason: &str| {
            Err(InvalidSetting {
                field,
                reason: reason.to_string(),
            })
        };

        if self.retry_ceiling == 0 {
            return invalid("retry_ceiling", "must be at least 1");
        }
        if self.fetch_timeout_secs == 0 {
            return invalid("fetch_timeout_secs", "must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "must be at least 1");
        }
        if !(self.retry.multiplier >= 1.0) {
            return invalid("retry.multiplier", "must be >= 1.0");
        }
        if self.retry.initial_interval_ms > self.retry.max_interval_ms {
            return invalid("retry.initial_interval_ms", "exceeds retry.max_interval_ms");
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.rate == 0 {
            return invalid("rate_limit", "capacity and rate must be positive");
        }
        if self.poll.interval_secs == 0 {
            return invalid("poll.interval_secs", "must be positive");
        }
        if self.poll.max_wait_secs < self.poll.interval_secs {
            return invalid("poll.max_wait_secs", "shorter than one poll interval");
        }
        Ok(())
    }
}
