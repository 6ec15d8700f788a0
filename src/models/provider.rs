use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI Compatible",
            ProviderKind::Anthropic => "Anthropic Claude",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            _ => None,
        }
    }
}

/// A model offered by a configured provider. `provider` is the provider config id,
/// not the kind, so two OpenAI-compatible endpoints can coexist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
}

impl Model {
    pub fn new(provider: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            provider: provider.to_string(),
            name: id.to_string(),
            group: None,
        }
    }

    /// Parses `provider:model`, the form accepted on the command line.
    pub fn parse_qualified(s: &str) -> Option<Self> {
        let (provider, id) = s.split_once(':')?;
        if provider.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(provider, id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub name: String,
    pub api_host: String,
    /// One key, or several separated by commas to rotate between.
    pub api_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<Model>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn api_keys(&self) -> Vec<&str> {
        self.api_key
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// Round-robin over the comma-separated keys of a provider.
#[derive(Debug, Default)]
pub struct KeyRotation {
    cursor: AtomicUsize,
}

impl KeyRotation {
    pub fn next<'a>(&self, config: &'a ProviderConfig) -> &'a str {
        let keys = config.api_keys();
        match keys.len() {
            0 => "",
            1 => keys[0],
            n => keys[self.cursor.fetch_add(1, Ordering::Relaxed) % n],
        }
    }
}
