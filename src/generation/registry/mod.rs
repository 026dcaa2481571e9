#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::{GenerationProvider, OpenAiClient};
use crate::embeddings::OllamaClient;
use crate::{RagError, Result};

/// Declarative settings for one generation provider, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSettings {
    Ollama {
        name: String,
        model: String,
        #[serde(default = "default_protocol")]
        protocol: String,
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_ollama_port")]
        port: u16,
    },
    #[serde(rename = "openai")]
    OpenAi {
        name: String,
        model: String,
        base_url: String,
        api_key_env: String,
    },
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_ollama_port() -> u16 {
    11434
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Ollama,
    OpenAi,
}

impl fmt::Display for ProviderKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

impl ProviderSettings {
    #[inline]
    pub fn name(&self) -> &str {
        match self {
            Self::Ollama { name, .. } | Self::OpenAi { name, .. } => name,
        }
    }

    #[inline]
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Ollama { .. } => ProviderKind::Ollama,
            Self::OpenAi { .. } => ProviderKind::OpenAi,
        }
    }

    #[inline]
    pub fn model(&self) -> &str {
        match self {
            Self::Ollama { model, .. } | Self::OpenAi { model, .. } => model,
        }
    }

    /// Check the settings are complete and well-formed
    #[inline]
    pub fn validate(&self) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(RagError::Validation(
                "Provider name must not be empty".to_string(),
            ));
        }
        if self.model().trim().is_empty() {
            return Err(RagError::Validation(format!(
                "Provider {} has no model",
                self.name()
            )));
        }

        match self {
            Self::Ollama { .. } => {
                self.ollama_url()?;
            }
            Self::OpenAi {
                name,
                base_url,
                api_key_env,
                ..
            } => {
                let url = Url::parse(base_url).map_err(|e| {
                    RagError::Validation(format!("Provider {} has invalid base_url: {}", name, e))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(RagError::Validation(format!(
                        "Provider {} base_url must be http or https",
                        name
                    )));
                }
                if api_key_env.trim().is_empty() {
                    return Err(RagError::Validation(format!(
                        "Provider {} must name an API key environment variable",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    fn ollama_url(&self) -> Result<Url> {
        let Self::Ollama {
            name,
            protocol,
            host,
            port,
            ..
        } = self
        else {
            return Err(RagError::Validation(format!(
                "Provider {} is not an Ollama provider",
                self.name()
            )));
        };
        if protocol != "http" && protocol != "https" {
            return Err(RagError::Validation(format!(
                "Provider {} has invalid protocol {}",
                name, protocol
            )));
        }
        if *port == 0 {
            return Err(RagError::Validation(format!(
                "Provider {} has invalid port 0",
                name
            )));
        }
        let url = format!("{}://{}:{}", protocol, host, port);
        Url::parse(&url).map_err(|e| {
            RagError::Validation(format!("Provider {} has invalid URL {}: {}", name, url, e))
        })
    }

    /// Validate and construct the provider these settings describe
    #[inline]
    pub fn build(&self, timeout: Duration) -> Result<Arc<dyn GenerationProvider>> {
        self.validate()?;
        match self {
            Self::Ollama { name, model, .. } => Ok(Arc::new(OllamaClient::new(
                name,
                self.ollama_url()?,
                model,
                timeout,
            )?)),
            Self::OpenAi {
                name,
                model,
                base_url,
                api_key_env,
            } => Ok(Arc::new(OpenAiClient::new(
                name,
                model,
                base_url,
                api_key_env,
                timeout,
            )?)),
        }
    }
}

/// Generation providers addressable by name, with one designated default
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn GenerationProvider>>,
    default_provider: String,
}

impl fmt::Debug for ProviderRegistry {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("default_provider", &self.default_provider)
            .finish()
    }
}

impl ProviderRegistry {
    #[inline]
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: BTreeMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Build every configured provider, rejecting invalid settings up front
    #[inline]
    pub fn from_settings(
        settings: &[ProviderSettings],
        default_provider: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut registry = Self::new(default_provider);
        for entry in settings {
            registry.register(entry.build(timeout)?)?;
            debug!(
                "Registered {} provider {} (model {})",
                entry.kind(),
                entry.name(),
                entry.model()
            );
        }

        if !registry.contains(default_provider) {
            return Err(RagError::Validation(format!(
                "Default provider '{}' is not registered",
                default_provider
            )));
        }

        info!(
            "Provider registry ready with {} providers (default {})",
            registry.providers.len(),
            default_provider
        );
        Ok(registry)
    }

    /// Add a provider under its own name; names must be unique
    #[inline]
    pub fn register(&mut self, provider: Arc<dyn GenerationProvider>) -> Result<()> {
        let name = provider.name().to_string();
        if name.trim().is_empty() {
            return Err(RagError::Validation(
                "Provider name must not be empty".to_string(),
            ));
        }
        if self.providers.contains_key(&name) {
            return Err(RagError::Validation(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    /// Look up a provider; an unknown name is reported as unavailable
    #[inline]
    pub fn get(&self, name: &str) -> Result<Arc<dyn GenerationProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| RagError::unavailable(name, "provider is not registered"))
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    #[inline]
    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    #[inline]
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}
