use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::assistants::AssistantService;
use super::conversation::fallback_topic_name;
use super::events::StoreEvent;
use super::messages::MessageStore;
use super::settings::SharedSettings;
use crate::config;
use crate::models::{Assistant, Topic};
use crate::providers::ProviderRegistry;

/// Names topics that still carry the default title once they have a few
/// messages. At most one rename runs per topic; requests arriving meanwhile
/// are dropped.
pub struct TopicNamer {
    providers: Arc<ProviderRegistry>,
    assistants: Arc<AssistantService>,
    messages: Arc<MessageStore>,
    settings: SharedSettings,
    renaming: Mutex<HashSet<String>>,
}

/// Holds a topic's slot in the in-flight set.
struct RenameSlot<'a> {
    renaming: &'a Mutex<HashSet<String>>,
    topic_id: String,
}

impl Drop for RenameSlot<'_> {
    fn drop(&mut self) {
        self.renaming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.topic_id);
    }
}

impl TopicNamer {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        assistants: Arc<AssistantService>,
        messages: Arc<MessageStore>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            providers,
            assistants,
            messages,
            settings,
            renaming: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, topic_id: &str) -> Option<RenameSlot<'_>> {
        let inserted = self
            .renaming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic_id.to_string());
        inserted.then(|| RenameSlot {
            renaming: &self.renaming,
            topic_id: topic_id.to_string(),
        })
    }

    fn wants_name(topic: &Topic) -> bool {
        topic.has_default_name() && !topic.is_name_manually_edited
    }

    /// Returns the new name when the topic was renamed.
    pub async fn auto_rename(&self, assistant: &Assistant, topic_id: &str) -> Option<String> {
        let Some(_slot) = self.claim(topic_id) else {
            tracing::debug!("Rename of topic {} already running", topic_id);
            return None;
        };

        let topic = self.assistants.find_topic(topic_id)?;
        let messages = self.messages.topic_messages(topic_id);
        if messages.len() < config::AUTO_RENAME_MIN_MESSAGES || !Self::wants_name(&topic) {
            return None;
        }

        let settings = self.settings.get();
        let name = if settings.enable_topic_naming {
            let model = settings
                .naming_model()
                .cloned()
                .or_else(|| assistant.model.clone())?;
            let provider = match self.providers.for_model(&model) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::warn!("Cannot name topic {}: {}", topic_id, e);
                    return None;
                }
            };
            let mut namer = assistant.with_model(Some(model));
            namer.prompt = settings.topic_naming_prompt.clone();
            match provider.summaries(&messages, &namer).await {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!("Failed to summarize topic {}: {}", topic_id, e);
                    return None;
                }
            }
        } else {
            fallback_topic_name(&messages)?
        };
        if name.is_empty() {
            return None;
        }

        // The user may have renamed it while the summary was running
        let mut topic = self.assistants.find_topic(topic_id)?;
        if !Self::wants_name(&topic) {
            return None;
        }
        topic.name = name.clone();
        if let Err(e) = self.assistants.update_topic(&topic).await {
            tracing::error!("Failed to rename topic {}: {}", topic_id, e);
            return None;
        }
        tracing::info!("Named topic {} \"{}\"", topic_id, name);
        self.messages.publish(StoreEvent::TopicRenamed {
            topic_id: topic_id.to_string(),
            name: name.clone(),
        });
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;
    use crate::models::{Message, Model, Role};
    use crate::providers::fake::{FakeProvider, Round};
    use crate::services::database::Database;
    use crate::services::files::FileManager;
    use crate::services::settings::AppSettings;

    struct Fixture {
        namer: TopicNamer,
        provider: Arc<FakeProvider>,
        assistants: Arc<AssistantService>,
        assistant: Assistant,
        topic_id: String,
    }

    async fn fixture(provider: FakeProvider, enable_naming: bool, message_count: usize) -> Fixture {
        let db = Database::new_in_memory().unwrap();
        let assistants = Arc::new(AssistantService::load(db.clone()).await.unwrap());
        let assistant = assistants.assistants()[0].with_model(Some(Model::new("fake", "m")));
        let topic_id = assistant.topics[0].id.clone();

        let messages = Arc::new(MessageStore::new(Arc::new(db.clone()), FileManager::new(db)));
        let conversation: Vec<Message> = (0..message_count)
            .map(|i| {
                let mut m = Message::user(&assistant.id, &topic_id, &format!("Plan a trip to Lisbon {}", i));
                if i % 2 == 1 {
                    m.role = Role::Assistant;
                }
                m
            })
            .collect();
        messages.load_topic_messages(&topic_id, conversation);

        let provider = Arc::new(provider);
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(provider.clone());
        let settings = SharedSettings::new(AppSettings {
            enable_topic_naming: enable_naming,
            ..Default::default()
        });

        Fixture {
            namer: TopicNamer::new(providers, assistants.clone(), messages, settings),
            provider,
            assistants,
            assistant,
            topic_id,
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_summarize_once() {
        let gate = Arc::new(Notify::new());
        let f = fixture(
            FakeProvider::new("fake").with_round(Round::gated(&["Lisbon trip"], gate.clone())),
            true,
            3,
        )
        .await;

        let (first, second, _) = tokio::join!(
            f.namer.auto_rename(&f.assistant, &f.topic_id),
            f.namer.auto_rename(&f.assistant, &f.topic_id),
            async {
                tokio::task::yield_now().await;
                gate.notify_one();
            }
        );

        assert_eq!(f.provider.calls(), 1);
        assert_eq!(first.as_deref(), Some("Lisbon trip"));
        assert!(second.is_none());
        assert_eq!(f.assistants.find_topic(&f.topic_id).unwrap().name, "Lisbon trip");
    }

    #[tokio::test]
    async fn test_slot_is_released_after_rename() {
        let f = fixture(
            FakeProvider::new("fake").with_round(Round::fail("HTTP 500: down")),
            true,
            2,
        )
        .await;
        assert!(f.namer.auto_rename(&f.assistant, &f.topic_id).await.is_none());
        let name = f.namer.auto_rename(&f.assistant, &f.topic_id).await;
        assert_eq!(name.as_deref(), Some("ok"));
        assert_eq!(f.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_disabled_naming_uses_first_message() {
        let f = fixture(FakeProvider::new("fake"), false, 2).await;
        let name = f.namer.auto_rename(&f.assistant, &f.topic_id).await;
        assert_eq!(name.as_deref(), Some("Plan a trip to Lisbon 0"));
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_skips_short_or_named_topics() {
        let f = fixture(FakeProvider::new("fake"), true, 1).await;
        assert!(f.namer.auto_rename(&f.assistant, &f.topic_id).await.is_none());

        let f = fixture(FakeProvider::new("fake"), true, 4).await;
        f.assistants.rename_topic(&f.topic_id, "Mine").await.unwrap();
        assert!(f.namer.auto_rename(&f.assistant, &f.topic_id).await.is_none());
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_naming_prompt_overrides_default() {
        let f = fixture(FakeProvider::new("fake"), true, 2).await;
        let mut settings = f.namer.settings.get();
        settings.topic_naming_prompt = "Name it in French.".to_string();
        settings.topic_naming_model = Some(Model::new("fake", "namer"));
        f.namer.settings.replace(settings);

        f.namer.auto_rename(&f.assistant, &f.topic_id).await.unwrap();
        let request = &f.provider.requests()[0];
        assert_eq!(request.model, "namer");
        assert_eq!(request.system_prompt.as_deref(), Some("Name it in French."));
    }
}
