// Application context
// Built once from configuration and handed to every command handler

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::database::{Database, VectorIndex};
use crate::embeddings::{EmbeddingPipeline, EmbeddingProvider, OllamaClient};
use crate::generation::ProviderRegistry;
use crate::rag::{GenerationDefaults, QueryOptions, RetrievalOrchestrator};

/// Every long-lived service of a ragline process
#[derive(Debug)]
pub struct AppContext {
    config: Config,
    database: Database,
    cache: Arc<EmbeddingCache>,
    orchestrator: RetrievalOrchestrator,
}

impl AppContext {
    /// Connect the configured Ollama embedder and generation providers
    #[inline]
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let embedder = OllamaClient::from_embedding_config(&config.embedding)
            .context("Failed to create embedding client")?;
        let providers = ProviderRegistry::from_settings(
            &config.generation.providers,
            &config.generation.default_provider,
            config.generation.timeout(),
        )
        .context("Failed to build generation providers")?;

        Self::with_providers(config, Arc::new(embedder), providers).await
    }

    /// Assemble the context around explicit providers
    #[inline]
    pub async fn with_providers(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        let base_dir = config.get_base_dir();
        std::fs::create_dir_all(base_dir).with_context(|| {
            format!("Failed to create data directory: {}", base_dir.display())
        })?;

        let database = Database::new(config.cache_database_path())
            .await
            .context("Failed to open cache database")?;
        let cache = Arc::new(EmbeddingCache::new(
            database.clone(),
            config.cache.max_size,
            config.cache.default_ttl(),
        ));

        let pipeline = Arc::new(EmbeddingPipeline::new(
            embedder,
            Arc::clone(&cache),
            config.chunking.clone(),
            config.embedding.model.as_str(),
            config.embedding.dimension,
        ));

        let index = Arc::new(VectorIndex::new(config.embedding.dimension));
        let index_path = config.vector_index_path();
        let loaded = index.load(&index_path).await.with_context(|| {
            format!("Failed to load vector index from {}", index_path.display())
        })?;
        if loaded {
            info!("Restored vector index with {} entries", index.len().await);
        }

        let orchestrator = RetrievalOrchestrator::new(
            pipeline,
            index,
            Arc::new(providers),
            GenerationDefaults {
                max_tokens: config.generation.max_tokens,
                temperature: config.generation.temperature,
            },
        )
        .with_history_turns(config.retrieval.history_turns)
        .with_ingest_concurrency(config.embedding.concurrency);

        Ok(Self {
            config,
            database,
            cache,
            orchestrator,
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    #[inline]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    #[inline]
    pub fn orchestrator(&self) -> &RetrievalOrchestrator {
        &self.orchestrator
    }

    /// Query options seeded from the retrieval and generation settings
    #[inline]
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            max_sources: self.config.retrieval.max_sources,
            min_confidence: self.config.retrieval.min_confidence,
            timeout: Some(self.config.generation.timeout()),
            ..QueryOptions::default()
        }
    }

    /// Write the vector index snapshot to the data directory
    #[inline]
    pub async fn persist(&self) -> Result<()> {
        let path = self.config.vector_index_path();
        self.orchestrator
            .index()
            .save(&path)
            .await
            .with_context(|| format!("Failed to save vector index to {}", path.display()))
    }

    /// Start the periodic cache sweep, if one is configured
    #[inline]
    pub fn spawn_cache_sweeper(&self) -> Option<JoinHandle<()>> {
        match self.config.cache.sweep_interval_seconds {
            0 => {
                warn!("Cache sweeping disabled; expired entries are only purged on read");
                None
            }
            seconds => Some(self.cache.spawn_sweeper(Duration::from_secs(seconds))),
        }
    }
}
