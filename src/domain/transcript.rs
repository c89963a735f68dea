//! Recognized text produced for a completed task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transcript of one task; at most one per task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub id: Uuid,

    pub task_id: Uuid,

    /// Concatenated recognized text
    pub text: String,

    /// Recognizer response as received, for auditing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
}

impl Transcript {
    pub fn new(task_id: Uuid, text: impl Into<String>, raw_response: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            text: text.into(),
            raw_response,
            created_at: Utc::now(),
        }
    }
}
