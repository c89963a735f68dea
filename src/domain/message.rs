//! Queue message: the projection of a task that travels through the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::Task;

/// Name of the queue carrying voice tasks
pub const VOICE_QUEUE: &str = "voice_processing";

/// Wire payload for one task, encoded as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub task_id: Uuid,
    pub chat_id: i64,
    pub message_id: i64,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<&Task> for QueueMessage {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            chat_id: task.source.chat_id,
            message_id: task.source.message_id,
            file_id: task.file_id.clone(),
            duration_secs: task.meta.duration_secs,
            file_size: task.meta.file_size,
            mime_type: task.meta.mime_type.clone(),
            created_at: task.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SourceRef, TaskMeta};

    #[test]
    fn test_projection_carries_task_fields() {
        let meta = TaskMeta {
            duration_secs: Some(4),
            mime_type: Some("audio/ogg".to_string()),
            ..Default::default()
        };
        let task = Task::new(SourceRef::new(10, 20), "f-1", meta);
        let message = QueueMessage::from(&task);

        assert_eq!(message.task_id, task.id);
        assert_eq!(message.chat_id, 10);
        assert_eq!(message.message_id, 20);
        assert_eq!(message.file_id, "f-1");
        assert_eq!(message.duration_secs, Some(4));
        assert_eq!(message.mime_type.as_deref(), Some("audio/ogg"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(QueueMessage::from_bytes(b"not json").is_err());
        assert!(QueueMessage::from_bytes(br#"{"task_id":"nope"}"#).is_err());
    }
}
