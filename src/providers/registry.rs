use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::anthropic::AnthropicProvider;
use super::openai::OpenAiProvider;
use super::traits::AiProvider;
use super::types::ProviderError;
use crate::models::{Model, ProviderConfig, ProviderKind};

/// Builds the backend for one provider configuration.
pub fn create_provider(config: ProviderConfig) -> Arc<dyn AiProvider> {
    match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)),
    }
}

/// Live providers keyed by their configuration id.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn AiProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Self {
        let registry = Self::new();
        registry.reload(configs);
        registry
    }

    /// Replaces every provider with fresh instances for the enabled configs.
    pub fn reload(&self, configs: &[ProviderConfig]) {
        let providers: HashMap<String, Arc<dyn AiProvider>> = configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (c.id.clone(), create_provider(c.clone())))
            .collect();
        tracing::debug!("Loaded {} providers", providers.len());
        *self.providers.write().unwrap_or_else(|e| e.into_inner()) = providers;
    }

    pub fn register(&self, provider: Arc<dyn AiProvider>) {
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(provider.provider_id().to_string(), provider);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn AiProvider>, ProviderError> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ProviderError::RequestFailed(format!("Unknown provider: {}", provider_id)))
    }

    pub fn for_model(&self, model: &Model) -> Result<Arc<dyn AiProvider>, ProviderError> {
        self.get(&model.provider)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
