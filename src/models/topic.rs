use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;
use crate::config;

/// Topic metadata lives in its assistant's record; the message list is stored
/// separately, keyed by topic id, and is never serialized with the metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub assistant_id: String,
    pub name: String,
    #[serde(default)]
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub is_name_manually_edited: bool,
    #[serde(skip)]
    pub messages: Vec<Message>,
}

impl Topic {
    pub fn new(assistant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            assistant_id: assistant_id.to_string(),
            name: config::DEFAULT_TOPIC_NAME.to_string(),
            prompt: None,
            created_at: now,
            updated_at: now,
            pinned: false,
            is_name_manually_edited: false,
            messages: Vec::new(),
        }
    }

    pub fn has_default_name(&self) -> bool {
        self.name == config::DEFAULT_TOPIC_NAME
    }
}
