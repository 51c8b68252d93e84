use crate::clients::{ProviderConfig, ProviderType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub context_window: u32,
}

/// Defaults offered when a provider of this type is first configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTemplate {
    pub provider_type: ProviderType,
    pub name: &'static str,
    pub default_base_url: &'static str,
    pub api_key_url: Option<&'static str>,
    pub api_key_placeholder: &'static str,
    /// Empty when the user must name the model.
    pub default_model_id: &'static str,
    pub models: &'static [ModelInfo],
}

static TEMPLATES: [ProviderTemplate; 5] = [
    ProviderTemplate {
        provider_type: ProviderType::OpenAI,
        name: "OpenAI",
        default_base_url: "https://api.openai.com/v1",
        api_key_url: Some("https://platform.openai.com/api-keys"),
        api_key_placeholder: "sk-...",
        default_model_id: "gpt-4o",
        models: &[
            ModelInfo { id: "gpt-4o", name: "GPT-4o", context_window: 128_000 },
            ModelInfo { id: "gpt-4o-mini", name: "GPT-4o Mini", context_window: 128_000 },
            ModelInfo { id: "o1", name: "o1", context_window: 200_000 },
            ModelInfo { id: "o3-mini", name: "o3-mini", context_window: 200_000 },
        ],
    },
    ProviderTemplate {
        provider_type: ProviderType::Anthropic,
        name: "Anthropic",
        default_base_url: "https://api.anthropic.com",
        api_key_url: Some("https://console.anthropic.com/settings/keys"),
        api_key_placeholder: "sk-ant-...",
        default_model_id: "claude-sonnet-4-20250514",
        models: &[
            ModelInfo { id: "claude-sonnet-4-20250514", name: "Claude 4 Sonnet", context_window: 200_000 },
            ModelInfo { id: "claude-opus-4-20250514", name: "Claude 4 Opus", context_window: 200_000 },
        ],
    },
    ProviderTemplate {
        provider_type: ProviderType::Google,
        name: "Google",
        default_base_url: "https://generativelanguage.googleapis.com/v1beta",
        api_key_url: Some("https://aistudio.google.com/apikey"),
        api_key_placeholder: "AI...",
        default_model_id: "gemini-2.0-flash",
        models: &[
            ModelInfo { id: "gemini-2.0-flash", name: "Gemini 2.0 Flash", context_window: 1_048_576 },
            ModelInfo { id: "gemini-2.5-pro", name: "Gemini 2.5 Pro", context_window: 1_048_576 },
        ],
    },
    ProviderTemplate {
        provider_type: ProviderType::OpenRouter,
        name: "OpenRouter",
        default_base_url: "https://openrouter.ai/api/v1",
        api_key_url: Some("https://openrouter.ai/keys"),
        api_key_placeholder: "sk-or-...",
        default_model_id: "anthropic/claude-sonnet-4",
        models: &[
            ModelInfo { id: "anthropic/claude-sonnet-4", name: "Claude 4 Sonnet", context_window: 200_000 },
            ModelInfo { id: "openai/gpt-4o", name: "GPT-4o", context_window: 128_000 },
            ModelInfo { id: "google/gemini-2.0-flash-001", name: "Gemini 2.0 Flash", context_window: 1_048_576 },
            ModelInfo { id: "meta-llama/llama-3.3-70b-instruct", name: "Llama 3.3 70B", context_window: 131_072 },
        ],
    },
    ProviderTemplate {
        provider_type: ProviderType::OpenAICompatible,
        name: "OpenAI Compatible",
        default_base_url: "http://localhost:11434/v1",
        api_key_url: None,
        api_key_placeholder: "API key (optional)",
        default_model_id: "",
        models: &[],
    },
];

pub fn templates() -> &'static [ProviderTemplate] {
    &TEMPLATES
}

pub fn template_for(provider_type: ProviderType) -> Option<&'static ProviderTemplate> {
    TEMPLATES.iter().find(|t| t.provider_type == provider_type)
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),
}

/// Configured providers plus the one used by default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub default_provider_id: Option<String>,
}

impl Settings {
    /// The default provider, or the first configured one when the default
    /// id is unset or stale.
    pub fn selected(&self) -> Option<&ProviderConfig> {
        self.default_provider_id
            .as_deref()
            .and_then(|id| self.provider(id))
            .or_else(|| self.providers.first())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Inserts or replaces by id. The first provider saved becomes the default.
    pub fn save_provider(&mut self, provider: ProviderConfig) {
        match self.providers.iter_mut().find(|p| p.id == provider.id) {
            Some(existing) => *existing = provider,
            None => self.providers.push(provider),
        }
        if self.providers.len() == 1 {
            self.default_provider_id = Some(self.providers[0].id.clone());
        }
    }

    pub fn delete_provider(&mut self, id: &str) -> Result<ProviderConfig, SettingsError> {
        let idx = self
            .providers
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| SettingsError::ProviderNotFound(id.to_string()))?;
        if self.default_provider_id.as_deref() == Some(id) {
            self.default_provider_id = None;
        }
        Ok(self.providers.remove(idx))
    }

    pub fn select_provider(&mut self, id: &str) -> Result<(), SettingsError> {
        if self.provider(id).is_none() {
            return Err(SettingsError::ProviderNotFound(id.to_string()));
        }
        self.default_provider_id = Some(id.to_string());
        Ok(())
    }
}

pub async fn load_settings(path: &Path) -> Result<Settings, SettingsError> {
    if !path.exists() {
        debug!(path = %path.display(), "no settings file, using empty settings");
        return Ok(Settings::default());
    }

    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

pub async fn save_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    tokio::fs::write(path, content).await?;
    Ok(())
}
