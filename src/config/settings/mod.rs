
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::embeddings::chunking::ChunkingConfig;
use crate::generation::registry::ProviderSettings;

pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Connection settings for the Ollama embedding endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub dimension: usize,
    /// Number of documents embedded concurrently during batch ingestion
    pub concurrency: usize,
    pub timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "all-minilm:latest".to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            concurrency: 4,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub default_provider: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub providers: Vec<ProviderSettings>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_provider: "ollama".to_string(),
            max_tokens: 2000,
            temperature: 0.7,
            timeout_seconds: 120,
            providers: vec![
                ProviderSettings::Ollama {
                    name: "ollama".to_string(),
                    model: "llama3.2:latest".to_string(),
                    protocol: "http".to_string(),
                    host: "localhost".to_string(),
                    port: 11434,
                },
                ProviderSettings::OpenAi {
                    name: "openai".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    base_url: "https://api.openai.com/v1".to_string(),
                    api_key_env: "OPENAI_API_KEY".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries held in the memory tier
    pub max_size: usize,
    pub default_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_seconds: 3600,
            sweep_interval_seconds: 300,
        }
    }
}

impl CacheConfig {
    #[inline]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_sources: usize,
    pub min_confidence: f32,
    /// How many prior conversation turns are included in the prompt
    pub history_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_sources: 5,
            min_confidence: 0.7,
            history_turns: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Data directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding dimension: {0} (must be between 8 and 4096)")]
    InvalidEmbeddingDimension(usize),
    #[error("Invalid embedding concurrency: {0} (must be between 1 and 64)")]
    InvalidConcurrency(usize),
    #[error("Invalid timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid max chunk size: {0} (must be between 16 and 8192)")]
    InvalidMaxChunkSize(usize),
    #[error("Overlap ({0}) must be smaller than max chunk size ({1})")]
    OverlapTooLarge(usize, usize),
    #[error("Invalid cache size: {0} (must be at least 1)")]
    InvalidCacheSize(usize),
    #[error("Invalid cache TTL: {0} (must be at least 1 second)")]
    InvalidCacheTtl(u64),
    #[error("Invalid max sources: {0} (must be between 1 and 100)")]
    InvalidMaxSources(usize),
    #[error("Invalid min confidence: {0} (must be in (0, 1])")]
    InvalidMinConfidence(f32),
    #[error("Invalid max tokens: {0} (must be at least 1)")]
    InvalidMaxTokens(u32),
    #[error("Invalid temperature: {0} (must be between 0 and 2)")]
    InvalidTemperature(f32),
    #[error("Invalid provider settings: {0}")]
    InvalidProvider(String),
    #[error("Default provider '{0}' is not among the configured providers")]
    UnknownDefaultProvider(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            chunking: ChunkingConfig::default(),
            cache: CacheConfig::default(),
            retrieval: RetrievalConfig::default(),
            base_dir: Self::default_data_dir().unwrap_or_else(|_| PathBuf::from(".ragline")),
        }
    }
}

impl Config {
    /// Platform data directory for ragline, e.g. `~/.local/share/ragline`
    #[inline]
    pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
        dirs::data_dir()
            .map(|data| data.join("ragline"))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.generation.validate()?;
        self.validate_chunking_config()?;
        self.validate_cache_config()?;
        self.validate_retrieval_config()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(16..=8192).contains(&config.max_chunk_size) {
            return Err(ConfigError::InvalidMaxChunkSize(config.max_chunk_size));
        }

        if config.overlap >= config.max_chunk_size {
            return Err(ConfigError::OverlapTooLarge(
                config.overlap,
                config.max_chunk_size,
            ));
        }

        Ok(())
    }

    fn validate_cache_config(&self) -> Result<(), ConfigError> {
        if self.cache.max_size == 0 {
            return Err(ConfigError::InvalidCacheSize(self.cache.max_size));
        }

        if self.cache.default_ttl_seconds == 0 {
            return Err(ConfigError::InvalidCacheTtl(self.cache.default_ttl_seconds));
        }

        Ok(())
    }

    fn validate_retrieval_config(&self) -> Result<(), ConfigError> {
        let config = &self.retrieval;

        if !(1..=100).contains(&config.max_sources) {
            return Err(ConfigError::InvalidMaxSources(config.max_sources));
        }

        if !(config.min_confidence > 0.0 && config.min_confidence <= 1.0) {
            return Err(ConfigError::InvalidMinConfidence(config.min_confidence));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the SQLite database backing the durable cache tier
    #[inline]
    pub fn cache_database_path(&self) -> PathBuf {
        self.get_base_dir().join("cache.db")
    }

    /// Get the directory holding the vector index snapshot
    #[inline]
    pub fn vector_index_path(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if !(8..=4096).contains(&self.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(self.dimension));
        }

        if !(1..=64).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tokens == 0 {
            return Err(ConfigError::InvalidMaxTokens(self.max_tokens));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidTemperature(self.temperature));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        for provider in &self.providers {
            provider
                .validate()
                .map_err(|e| ConfigError::InvalidProvider(e.to_string()))?;
        }

        if !self
            .providers
            .iter()
            .any(|p| p.name() == self.default_provider)
        {
            return Err(ConfigError::UnknownDefaultProvider(
                self.default_provider.clone(),
            ));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}
