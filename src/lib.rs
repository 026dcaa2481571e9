use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    /// Provider is not configured or cannot be reached at all.
    #[error("Provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// Provider was reachable but the call failed (timeout, 5xx, dropped connection).
    #[error("Provider '{provider}' failed: {message}")]
    ProviderTransientFailure { provider: String, message: String },

    #[error("Cache entry corrupted: {0}")]
    CacheCorruption(String),

    #[error("Index inconsistency: {0}")]
    IndexInconsistency(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    #[inline]
    pub fn unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderTransientFailure {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the error came from a provider call, i.e. is eligible for generation fallback
    #[inline]
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } | Self::ProviderTransientFailure { .. }
        )
    }
}

pub mod app;
pub mod cache;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod generation;
pub mod rag;
