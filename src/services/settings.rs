use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::database::Database;
use crate::config;
use crate::models::{Model, ProviderConfig};

const SETTINGS_KEY: &str = "app_settings";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub providers: Vec<ProviderConfig>,
    pub default_model: Option<Model>,
    pub topic_naming_model: Option<Model>,
    pub translate_model: Option<Model>,
    pub enable_topic_naming: bool,
    /// Overrides the built-in naming instruction when non-empty.
    pub topic_naming_prompt: String,
    pub stream_output: bool,
    pub queue_concurrency: usize,
    pub stream_throttle_ms: u64,
    pub translate_prompt: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            default_model: None,
            topic_naming_model: None,
            translate_model: None,
            enable_topic_naming: true,
            topic_naming_prompt: String::new(),
            stream_output: true,
            queue_concurrency: config::DEFAULT_QUEUE_CONCURRENCY,
            stream_throttle_ms: config::DEFAULT_STREAM_THROTTLE_MS,
            translate_prompt: config::TRANSLATE_PROMPT.to_string(),
        }
    }
}

impl AppSettings {
    /// The model used for naming topics: the dedicated one, else the default.
    pub fn naming_model(&self) -> Option<&Model> {
        self.topic_naming_model
            .as_ref()
            .or(self.default_model.as_ref())
    }

    pub fn queue_concurrency(&self) -> usize {
        self.queue_concurrency.max(1)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}

/// Settings handle shared by long-lived services. Readers take a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<AppSettings>>);

impl SharedSettings {
    pub fn new(settings: AppSettings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    pub fn get(&self) -> AppSettings {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, settings: AppSettings) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }
}

pub struct SettingsService;

impl SettingsService {
    pub async fn load(db: &Database) -> AppSettings {
        match db.get_setting(SETTINGS_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable settings: {}", e);
                AppSettings::default()
            }),
            Ok(None) => AppSettings::default(),
            Err(e) => {
                tracing::warn!("Failed to load settings: {}", e);
                AppSettings::default()
            }
        }
    }

    pub async fn save(db: &Database, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        db.set_setting(SETTINGS_KEY, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;

    #[tokio::test]
    async fn test_defaults_when_absent_or_corrupt() {
        let db = Database::new_in_memory().unwrap();
        let settings = SettingsService::load(&db).await;
        assert!(settings.enable_topic_naming);
        assert_eq!(settings.queue_concurrency, config::DEFAULT_QUEUE_CONCURRENCY);

        db.set_setting(SETTINGS_KEY, "{not json").await.unwrap();
        let settings = SettingsService::load(&db).await;
        assert_eq!(settings.stream_throttle_ms, config::DEFAULT_STREAM_THROTTLE_MS);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let db = Database::new_in_memory().unwrap();
        let mut settings = AppSettings::default();
        settings.providers.push(ProviderConfig {
            id: "local".to_string(),
            kind: ProviderKind::OpenAi,
            name: "LM Studio".to_string(),
            api_host: "http://localhost:1234".to_string(),
            api_key: String::new(),
            enabled: true,
            models: vec![Model::new("local", "qwen")],
        });
        settings.default_model = Some(Model::new("local", "qwen"));
        settings.enable_topic_naming = false;
        SettingsService::save(&db, &settings).await.unwrap();

        let loaded = SettingsService::load(&db).await;
        assert!(!loaded.enable_topic_naming);
        assert_eq!(loaded.provider("local").unwrap().models.len(), 1);
        assert_eq!(loaded.naming_model().unwrap().id, "qwen");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: AppSettings = serde_json::from_str(r#"{"queue_concurrency": 0}"#).unwrap();
        assert_eq!(settings.queue_concurrency(), 1);
        assert!(settings.stream_output);
    }
}
