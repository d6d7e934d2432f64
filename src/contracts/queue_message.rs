use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope published to the service queue.
///
/// Only `data.id` and `data.message` are required; the timestamps are
/// optional so producers that omit them still decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMessage {
    pub data: MessageData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub message: String,
}

impl QueueMessage {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            data: MessageData {
                id: id.into(),
                created_at: None,
                updated_at: None,
                message: message.into(),
            },
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
