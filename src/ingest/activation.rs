//! Per-chat activation flag, persisted in the key-value store.
//!
//! Every check reads the store, so all front-end instances agree and the
//! flag survives restarts. Entries expire after [`ACTIVATION_TTL`].

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::store::{KeyValueStore, StoreError};

/// How long an activation lasts without renewal
pub const ACTIVATION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub fn activation_key(chat_id: i64) -> String {
    format!("chat:active:{}", chat_id)
}

#[derive(Clone)]
pub struct ChatActivation {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ChatActivation {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            ttl: ACTIVATION_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Activate (or renew) a chat
    pub async fn activate(&self, chat_id: i64) -> Result<(), StoreError> {
        self.kv.set(&activation_key(chat_id), "1", Some(self.ttl)).await
    }

    /// Returns whether the chat was active
    pub async fn deactivate(&self, chat_id: i64) -> Result<bool, StoreError> {
        self.kv.delete(&activation_key(chat_id)).await
    }

    /// Lookup failures count as inactive
    pub async fn is_active(&self, chat_id: i64) -> bool {
        match self.kv.get(&activation_key(chat_id)).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                warn!(chat_id, error = %e, "Activation lookup failed, treating chat as inactive");
                false
            }
        }
    }
}
