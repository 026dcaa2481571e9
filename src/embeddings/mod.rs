// Embeddings module
// Document model, the embedding capability, chunking, and the incremental pipeline

pub mod chunking;
pub mod ollama;
pub mod pipeline;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

pub use chunking::{Chunk, ChunkingConfig, chunk_document, estimate_token_count};
pub use ollama::OllamaClient;
pub use pipeline::{EmbeddingPipeline, PipelineStats};

/// A raw document submitted for ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Overrides the pipeline's embedding model for this document
    #[serde(default)]
    pub embedding_model: Option<String>,
}

impl Document {
    #[inline]
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
            embedding_model: None,
        }
    }

    #[inline]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Embedding of a single chunk, as cached and as indexed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub document_id: String,
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    /// SHA-256 of the exact chunk text, hex encoded
    pub hash: String,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
}

/// Capability that turns text into a fixed-dimension vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name used in logs and errors
    fn name(&self) -> &str;

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>>;

    async fn health_check(&self) -> bool;
}

/// Stable content hash of chunk text
#[inline]
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Cache key for a chunk embedding: (document_id, chunk_id, hash) scoped to the model
#[inline]
pub fn embedding_cache_key(model: &str, document_id: &str, chunk_id: &str, hash: &str) -> String {
    format!("{}:{}_{}_{}", model, document_id, chunk_id, hash)
}
