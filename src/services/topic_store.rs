use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::Message;

/// A topic's persisted form: its id and the ordered message list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredTopic {
    pub id: String,
    pub messages: Vec<Message>,
}

/// Keyed document storage for topic message lists. Updates replace the whole
/// list; there is no querying beyond the id.
#[async_trait]
pub trait TopicStore: Send + Sync {
    async fn get(&self, topic_id: &str) -> Result<Option<StoredTopic>>;

    /// Replaces the stored list, creating the topic row if it is missing.
    async fn update(&self, topic_id: &str, messages: &[Message]) -> Result<()>;

    async fn add(&self, topic: &StoredTopic) -> Result<()>;

    async fn delete(&self, topic_id: &str) -> Result<()>;
}

#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory store that can be told to fail writes.
    #[derive(Default)]
    pub struct MemoryStore {
        topics: Mutex<HashMap<String, Vec<Message>>>,
        fail_writes: AtomicBool,
        writes: AtomicUsize,
        reads: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        pub fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        pub fn messages(&self, topic_id: &str) -> Vec<Message> {
            self.topics
                .lock()
                .unwrap()
                .get(topic_id)
                .cloned()
                .unwrap_or_default()
        }

        pub fn seed(&self, topic_id: &str, messages: Vec<Message>) {
            self.topics
                .lock()
                .unwrap()
                .insert(topic_id.to_string(), messages);
        }

        fn check_write(&self) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TopicStore for MemoryStore {
        async fn get(&self, topic_id: &str) -> Result<Option<StoredTopic>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .topics
                .lock()
                .unwrap()
                .get(topic_id)
                .map(|messages| StoredTopic {
                    id: topic_id.to_string(),
                    messages: messages.clone(),
                }))
        }

        async fn update(&self, topic_id: &str, messages: &[Message]) -> Result<()> {
            self.check_write()?;
            self.topics
                .lock()
                .unwrap()
                .insert(topic_id.to_string(), messages.to_vec());
            Ok(())
        }

        async fn add(&self, topic: &StoredTopic) -> Result<()> {
            self.check_write()?;
            self.topics
                .lock()
                .unwrap()
                .insert(topic.id.clone(), topic.messages.clone());
            Ok(())
        }

        async fn delete(&self, topic_id: &str) -> Result<()> {
            self.check_write()?;
            self.topics.lock().unwrap().remove(topic_id);
            Ok(())
        }
    }
}
