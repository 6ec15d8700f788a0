use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use super::database::Database;
use super::topics::TopicManager;
use crate::config;
use crate::models::{Assistant, Topic};

const ASSISTANTS_KEY: &str = "assistants";

/// Assistants and the metadata of their topics, kept as one JSON document in
/// the settings table. Message lists are not part of it.
pub struct AssistantService {
    db: Database,
    assistants: RwLock<Vec<Assistant>>,
}

impl AssistantService {
    /// Loads the saved assistants, seeding the default one on first run.
    pub async fn load(db: Database) -> Result<Self> {
        let mut assistants: Vec<Assistant> = match db.get_setting(ASSISTANTS_KEY).await? {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable assistants: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        if assistants.is_empty() {
            assistants.push(Self::default_assistant());
        }

        let service = Self {
            db,
            assistants: RwLock::new(assistants),
        };
        service.save().await?;
        Ok(service)
    }

    pub fn default_assistant() -> Assistant {
        Assistant::new(config::DEFAULT_ASSISTANT_ID, config::DEFAULT_ASSISTANT_NAME)
    }

    pub fn default_topic(assistant_id: &str) -> Topic {
        Topic::new(assistant_id)
    }

    fn snapshot(&self) -> Vec<Assistant> {
        self.assistants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn save(&self) -> Result<()> {
        let json = serde_json::to_string(&self.snapshot())?;
        self.db
            .set_setting(ASSISTANTS_KEY, &json)
            .await
            .context("Failed to save assistants")
    }

    /// Applies `edit` to the list and persists the result.
    async fn modify<T>(&self, edit: impl FnOnce(&mut Vec<Assistant>) -> Result<T>) -> Result<T> {
        let value = {
            let mut assistants = self.assistants.write().unwrap_or_else(|e| e.into_inner());
            edit(&mut assistants)?
        };
        self.save().await?;
        Ok(value)
    }

    pub fn assistants(&self) -> Vec<Assistant> {
        self.snapshot()
    }

    pub fn get(&self, assistant_id: &str) -> Option<Assistant> {
        self.assistants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.id == assistant_id)
            .cloned()
    }

    pub async fn add_assistant(&self, assistant: Assistant) -> Result<()> {
        self.modify(|assistants| {
            if assistants.iter().any(|a| a.id == assistant.id) {
                bail!("Assistant {} already exists", assistant.id);
            }
            assistants.push(assistant);
            Ok(())
        })
        .await
    }

    pub async fn update_assistant(&self, assistant: Assistant) -> Result<()> {
        self.modify(|assistants| {
            let existing = assistants
                .iter_mut()
                .find(|a| a.id == assistant.id)
                .with_context(|| format!("Assistant {} not found", assistant.id))?;
            // Topic metadata is edited through the topic calls only
            let topics = std::mem::take(&mut existing.topics);
            *existing = Assistant { topics, ..assistant };
            Ok(())
        })
        .await
    }

    pub fn find_topic(&self, topic_id: &str) -> Option<Topic> {
        self.assistants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flat_map(|a| a.topics.iter())
            .find(|t| t.id == topic_id)
            .cloned()
    }

    /// Newest topics first.
    pub async fn add_topic(&self, topic: Topic) -> Result<()> {
        self.modify(|assistants| {
            let assistant = assistants
                .iter_mut()
                .find(|a| a.id == topic.assistant_id)
                .with_context(|| format!("Assistant {} not found", topic.assistant_id))?;
            assistant.topics.insert(0, topic);
            Ok(())
        })
        .await
    }

    /// Replaces a topic's metadata. Every rename goes through here.
    pub async fn update_topic(&self, topic: &Topic) -> Result<()> {
        self.modify(|assistants| {
            let existing = assistants
                .iter_mut()
                .flat_map(|a| a.topics.iter_mut())
                .find(|t| t.id == topic.id)
                .with_context(|| format!("Topic {} not found", topic.id))?;
            *existing = Topic {
                updated_at: Utc::now(),
                messages: Vec::new(),
                ..topic.clone()
            };
            Ok(())
        })
        .await
    }

    /// A rename typed by the user; automatic naming leaves such topics alone.
    pub async fn rename_topic(&self, topic_id: &str, name: &str) -> Result<Topic> {
        let mut topic = self
            .find_topic(topic_id)
            .with_context(|| format!("Topic {} not found", topic_id))?;
        topic.name = name.trim().to_string();
        topic.is_name_manually_edited = true;
        self.update_topic(&topic).await?;
        Ok(topic)
    }

    /// Drops the topic's metadata, then its messages and their files.
    pub async fn remove_topic(&self, topic_id: &str, topics: &TopicManager) -> Result<()> {
        self.modify(|assistants| {
            for assistant in assistants.iter_mut() {
                assistant.topics.retain(|t| t.id != topic_id);
            }
            Ok(())
        })
        .await?;
        topics.remove_topic(topic_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::Message;
    use crate::services::files::FileManager;

    #[tokio::test]
    async fn test_first_load_seeds_default_assistant() {
        let db = Database::new_in_memory().unwrap();
        let service = AssistantService::load(db.clone()).await.unwrap();
        let assistants = service.assistants();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].id, config::DEFAULT_ASSISTANT_ID);
        assert_eq!(assistants[0].topics.len(), 1);

        let reloaded = AssistantService::load(db).await.unwrap();
        assert_eq!(reloaded.assistants()[0].topics[0].id, assistants[0].topics[0].id);
    }

    #[tokio::test]
    async fn test_manual_rename_marks_topic() {
        let service = AssistantService::load(Database::new_in_memory().unwrap())
            .await
            .unwrap();
        let topic_id = service.assistants()[0].topics[0].id.clone();

        let renamed = service.rename_topic(&topic_id, " Trip plans ").await.unwrap();
        assert_eq!(renamed.name, "Trip plans");
        assert!(renamed.is_name_manually_edited);
        assert!(service.find_topic(&topic_id).unwrap().is_name_manually_edited);
    }

    #[tokio::test]
    async fn test_add_and_remove_topic() {
        let db = Database::new_in_memory().unwrap();
        let service = AssistantService::load(db.clone()).await.unwrap();
        let topics = TopicManager::new(Arc::new(db.clone()), FileManager::new(db.clone()));

        let topic = AssistantService::default_topic(config::DEFAULT_ASSISTANT_ID);
        service.add_topic(topic.clone()).await.unwrap();
        assert_eq!(service.assistants()[0].topics[0].id, topic.id);
        db.insert_topic(&topic.id, &[Message::user("default", &topic.id, "hi")])
            .await
            .unwrap();

        service.remove_topic(&topic.id, &topics).await.unwrap();
        assert!(service.find_topic(&topic.id).is_none());
        assert!(topics.get_topic(&topic.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_topic_for_unknown_assistant_is_rejected() {
        let service = AssistantService::load(Database::new_in_memory().unwrap())
            .await
            .unwrap();
        assert!(service.add_topic(Topic::new("nobody")).await.is_err());
    }
}
