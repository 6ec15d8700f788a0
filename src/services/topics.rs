use std::sync::Arc;

use anyhow::{Context, Result};

use super::files::FileManager;
use super::topic_store::{StoredTopic, TopicStore};
use crate::models::Message;

/// Storage-side operations on whole topics. Removing or clearing a topic
/// releases the files its messages held.
#[derive(Clone)]
pub struct TopicManager {
    store: Arc<dyn TopicStore>,
    files: FileManager,
}

impl TopicManager {
    pub fn new(store: Arc<dyn TopicStore>, files: FileManager) -> Self {
        Self { store, files }
    }

    pub async fn get_topic(&self, topic_id: &str) -> Result<Option<StoredTopic>> {
        self.store.get(topic_id).await
    }

    pub async fn get_topic_messages(&self, topic_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .get_topic(topic_id)
            .await?
            .map(|t| t.messages)
            .unwrap_or_default())
    }

    pub async fn remove_topic(&self, topic_id: &str) -> Result<()> {
        let messages = self.get_topic_messages(topic_id).await?;
        self.files.delete_message_files(&messages).await;
        self.store
            .delete(topic_id)
            .await
            .with_context(|| format!("Failed to delete topic {}", topic_id))
    }

    pub async fn clear_topic_messages(&self, topic_id: &str) -> Result<()> {
        let messages = self.get_topic_messages(topic_id).await?;
        self.files.delete_message_files(&messages).await;
        self.store
            .update(topic_id, &[])
            .await
            .with_context(|| format!("Failed to clear topic {}", topic_id))
    }
}
