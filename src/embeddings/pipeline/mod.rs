
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::chunking::{ChunkingConfig, chunk_document};
use super::{Document, EmbeddingProvider, EmbeddingRecord, content_hash, embedding_cache_key};
use crate::cache::EmbeddingCache;
use crate::{RagError, Result};

/// Snapshot of the pipeline's running counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub documents_processed: u64,
    pub documents_failed: u64,
    pub embeddings_created: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_processing_ms: f64,
    pub average_processing_ms: f64,
}

#[derive(Debug, Default)]
struct Counters {
    documents_processed: AtomicU64,
    documents_failed: AtomicU64,
    embeddings_created: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    processing_micros: AtomicU64,
}

/// Chunks documents and embeds each chunk, reusing cached embeddings for unchanged text
pub struct EmbeddingPipeline {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    chunking: ChunkingConfig,
    model: String,
    dimension: usize,
    counters: Counters,
}

impl std::fmt::Debug for EmbeddingPipeline {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingPipeline")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("chunking", &self.chunking)
            .finish_non_exhaustive()
    }
}

impl EmbeddingPipeline {
    #[inline]
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        chunking: ChunkingConfig,
        model: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            chunking,
            model: model.into(),
            dimension,
            counters: Counters::default(),
        }
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embed every chunk of a document.
    ///
    /// Unchanged chunks come from the cache unless `force_reprocess` is set.
    /// Any chunk failure fails the whole document; chunks embedded before the
    /// failure stay cached.
    #[inline]
    pub async fn process(
        &self,
        document: &Document,
        force_reprocess: bool,
    ) -> Result<Vec<EmbeddingRecord>> {
        if document.id.trim().is_empty() {
            return Err(RagError::Validation(
                "Document id must not be empty".to_string(),
            ));
        }

        let started = Instant::now();
        let result = self.process_chunks(document, force_reprocess).await;
        self.counters.processing_micros.fetch_add(
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        match &result {
            Ok(records) => {
                self.counters
                    .documents_processed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Processed document {} into {} embeddings in {:?}",
                    document.id,
                    records.len(),
                    started.elapsed()
                );
            }
            Err(e) => {
                self.counters
                    .documents_failed
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Failed to process document {}: {}", document.id, e);
            }
        }
        result
    }

    async fn process_chunks(
        &self,
        document: &Document,
        force_reprocess: bool,
    ) -> Result<Vec<EmbeddingRecord>> {
        let model = document.embedding_model.as_deref().unwrap_or(&self.model);
        let chunks = chunk_document(document, &self.chunking);
        let mut records = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let hash = content_hash(&chunk.text);
            let key = embedding_cache_key(model, &document.id, &chunk.id, &hash);

            if !force_reprocess {
                match self.cache.get(&key).await {
                    Some(record) if record.vector.len() == self.dimension => {
                        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                        records.push(record);
                        continue;
                    }
                    Some(record) => warn!(
                        "Cached embedding for chunk {} has dimension {}, expected {}; recomputing",
                        chunk.id,
                        record.vector.len(),
                        self.dimension
                    ),
                    None => {}
                }
            }
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

            let vector = self.provider.embed(&chunk.text, model).await.map_err(|e| {
                warn!(
                    "Embedding failed for document {} chunk {}: {}",
                    document.id, chunk.id, e
                );
                e
            })?;
            if vector.len() != self.dimension {
                return Err(RagError::IndexInconsistency(format!(
                    "Provider {} returned {} dimensions for chunk {}, expected {}",
                    self.provider.name(),
                    vector.len(),
                    chunk.id,
                    self.dimension
                )));
            }

            let record = EmbeddingRecord {
                document_id: document.id.clone(),
                chunk_id: chunk.id,
                vector,
                text: chunk.text,
                hash,
                model_name: model.to_string(),
                created_at: Utc::now(),
            };
            if !self.cache.set(&key, record.clone(), None).await {
                warn!(
                    "Embedding for chunk {} was not persisted to the durable cache",
                    record.chunk_id
                );
            }
            self.counters
                .embeddings_created
                .fetch_add(1, Ordering::Relaxed);
            records.push(record);
        }

        Ok(records)
    }

    /// Process documents with at most `batch_size` in flight, keeping per-document outcomes
    #[inline]
    pub async fn try_batch_process(
        &self,
        documents: &[Document],
        batch_size: usize,
        force_reprocess: bool,
    ) -> Vec<Result<Vec<EmbeddingRecord>>> {
        let started = Instant::now();
        let results: Vec<Result<Vec<EmbeddingRecord>>> = stream::iter(documents)
            .map(|document| self.process(document, force_reprocess))
            .buffered(batch_size.max(1))
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            "Batch of {} documents processed in {:?} ({} failed)",
            documents.len(),
            started.elapsed(),
            failed
        );
        results
    }

    /// Process documents concurrently; a failed document yields an empty result
    #[inline]
    pub async fn batch_process(
        &self,
        documents: &[Document],
        batch_size: usize,
    ) -> Vec<Vec<EmbeddingRecord>> {
        self.try_batch_process(documents, batch_size, false)
            .await
            .into_iter()
            .map(Result::unwrap_or_default)
            .collect()
    }

    #[inline]
    pub fn stats(&self) -> PipelineStats {
        let processed = self.counters.documents_processed.load(Ordering::Relaxed);
        let failed = self.counters.documents_failed.load(Ordering::Relaxed);
        let total_ms = Duration::from_micros(self.counters.processing_micros.load(Ordering::Relaxed))
            .as_secs_f64()
            * 1000.0;
        let attempts = processed + failed;

        PipelineStats {
            documents_processed: processed,
            documents_failed: failed,
            embeddings_created: self.counters.embeddings_created.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            total_processing_ms: total_ms,
            average_processing_ms: if attempts == 0 {
                0.0
            } else {
                total_ms / attempts as f64
            },
        }
    }
}
