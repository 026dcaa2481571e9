// Retrieval module
// Query embedding, source retrieval, prompt assembly, generation with a single fallback, and ingestion


use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::{SearchHit, VectorIndex};
use crate::embeddings::{Document, EmbeddingPipeline, EmbeddingRecord};
use crate::generation::{GenerationProvider, GenerationRequest, GenerationStream, ProviderRegistry};
use crate::{RagError, Result};

/// Most recent conversation turns included in a prompt by default
pub const DEFAULT_HISTORY_TURNS: usize = 5;

const ANSWER_INSTRUCTION: &str = "Answer the question using the information provided. \
If the information is not sufficient to answer, say so instead of guessing.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    #[inline]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[inline]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-query parameters
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Provider to ask first; the registry default when `None`
    pub provider: Option<String>,
    /// Model for the first provider; that provider's default when `None`
    pub model: Option<String>,
    pub max_sources: usize,
    pub min_confidence: f32,
    pub history: Vec<ConversationTurn>,
    /// Upper bound on each generation attempt
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    #[inline]
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            max_sources: 5,
            min_confidence: 0.7,
            history: Vec::new(),
            timeout: None,
        }
    }
}

impl QueryOptions {
    fn validate(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(RagError::Validation(
                "Query text must not be empty".to_string(),
            ));
        }
        if self.max_sources == 0 {
            return Err(RagError::Validation(
                "max_sources must be at least 1".to_string(),
            ));
        }
        if !(self.min_confidence > 0.0 && self.min_confidence <= 1.0) {
            return Err(RagError::Validation(format!(
                "min_confidence must be in (0, 1], got {}",
                self.min_confidence
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(RagError::Validation(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A retrieved chunk and its similarity to the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSource {
    pub score: f32,
    pub record: EmbeddingRecord,
}

impl From<&SearchHit> for RetrievedSource {
    #[inline]
    fn from(hit: &SearchHit) -> Self {
        Self {
            score: hit.score,
            record: hit.to_record(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query_id: Uuid,
    pub query: String,
    pub answer: String,
    /// Sources in descending similarity order
    pub sources: Vec<RetrievedSource>,
    pub confidence: f32,
    pub provider_used: String,
    pub model_used: String,
    pub fell_back: bool,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Streaming counterpart of [`RetrievalResult`]; the answer arrives through `stream`
#[derive(Debug)]
pub struct RetrievalStream {
    pub query_id: Uuid,
    pub sources: Vec<RetrievedSource>,
    pub confidence: f32,
    pub provider_used: String,
    pub model_used: String,
    pub fell_back: bool,
    pub stream: GenerationStream,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub embeddings: usize,
    pub elapsed: Duration,
    /// (document id, error) for every failed document
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub requests: u64,
    pub failures: u64,
    pub total_ms: f64,
    pub average_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub queries_processed: u64,
    pub errors: u64,
    pub fallbacks: u64,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
    /// Keyed by registered provider name only
    pub provider_usage: BTreeMap<String, ProviderUsage>,
    /// Requests naming a provider that is not registered
    pub unknown_provider_requests: u64,
}

/// Generation parameters shared by every query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationDefaults {
    pub max_tokens: u32,
    pub temperature: f32,
}

struct Generated<T> {
    output: T,
    provider: String,
    model: String,
    fell_back: bool,
}

/// Answers questions from indexed documents and keeps the index fed
pub struct RetrievalOrchestrator {
    pipeline: Arc<EmbeddingPipeline>,
    index: Arc<VectorIndex>,
    providers: Arc<ProviderRegistry>,
    generation: GenerationDefaults,
    history_turns: usize,
    ingest_concurrency: usize,
    stats: Mutex<OrchestratorStats>,
}

impl std::fmt::Debug for RetrievalOrchestrator {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalOrchestrator")
            .field("pipeline", &self.pipeline)
            .field("providers", &self.providers)
            .field("generation", &self.generation)
            .field("history_turns", &self.history_turns)
            .finish_non_exhaustive()
    }
}

impl RetrievalOrchestrator {
    #[inline]
    pub fn new(
        pipeline: Arc<EmbeddingPipeline>,
        index: Arc<VectorIndex>,
        providers: Arc<ProviderRegistry>,
        generation: GenerationDefaults,
    ) -> Self {
        Self {
            pipeline,
            index,
            providers,
            generation,
            history_turns: DEFAULT_HISTORY_TURNS,
            ingest_concurrency: 4,
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    #[inline]
    pub fn with_history_turns(mut self, turns: usize) -> Self {
        self.history_turns = turns;
        self
    }

    #[inline]
    pub fn with_ingest_concurrency(mut self, concurrency: usize) -> Self {
        self.ingest_concurrency = concurrency.max(1);
        self
    }

    #[inline]
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    #[inline]
    pub fn pipeline(&self) -> &Arc<EmbeddingPipeline> {
        &self.pipeline
    }

    #[inline]
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Answer `text` from the indexed documents
    #[inline]
    pub async fn query(&self, text: &str, options: &QueryOptions) -> Result<RetrievalResult> {
        options.validate(text)?;
        let query_id = Uuid::new_v4();
        let started = Instant::now();
        info!("[{}] Processing query ({} chars)", query_id, text.len());

        let outcome = self.answer(query_id, text, options).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok((sources, generated)) => {
                let confidence = confidence(&sources);
                self.record_query(elapsed, generated.fell_back).await;
                info!(
                    "[{}] Answered with {} sources via {} in {:?} (confidence {:.2})",
                    query_id,
                    sources.len(),
                    generated.provider,
                    elapsed,
                    confidence
                );

                Ok(RetrievalResult {
                    query_id,
                    query: text.to_string(),
                    answer: generated.output,
                    sources,
                    confidence,
                    provider_used: generated.provider,
                    model_used: generated.model,
                    fell_back: generated.fell_back,
                    elapsed,
                    timestamp: Utc::now(),
                })
            }
            Err(e) => {
                self.stats.lock().await.errors += 1;
                warn!("[{}] Query failed: {}", query_id, e);
                Err(e)
            }
        }
    }

    /// Like [`Self::query`], but the answer is delivered as a fragment stream.
    ///
    /// Fallback applies only while opening the stream; later failures arrive
    /// as the stream's error event.
    #[inline]
    pub async fn query_stream(&self, text: &str, options: &QueryOptions) -> Result<RetrievalStream> {
        options.validate(text)?;
        let query_id = Uuid::new_v4();
        let started = Instant::now();
        info!("[{}] Processing streaming query ({} chars)", query_id, text.len());

        let outcome = async {
            let sources = self.retrieve(query_id, text, options).await?;
            let prompt = self.build_prompt(text, &options.history, &sources);
            let generated = self
                .generate_with_fallback(query_id, &prompt, options, StreamMode)
                .await?;
            Ok::<_, RagError>((sources, generated))
        }
        .await;

        match outcome {
            Ok((sources, generated)) => {
                self.record_query(started.elapsed(), generated.fell_back)
                    .await;
                Ok(RetrievalStream {
                    query_id,
                    confidence: confidence(&sources),
                    sources,
                    provider_used: generated.provider,
                    model_used: generated.model,
                    fell_back: generated.fell_back,
                    stream: generated.output,
                })
            }
            Err(e) => {
                self.stats.lock().await.errors += 1;
                warn!("[{}] Streaming query failed: {}", query_id, e);
                Err(e)
            }
        }
    }

    async fn answer(
        &self,
        query_id: Uuid,
        text: &str,
        options: &QueryOptions,
    ) -> Result<(Vec<RetrievedSource>, Generated<String>)> {
        let sources = self.retrieve(query_id, text, options).await?;
        let prompt = self.build_prompt(text, &options.history, &sources);
        let generated = self
            .generate_with_fallback(query_id, &prompt, options, TextMode)
            .await?;
        Ok((sources, generated))
    }

    /// Embed the query and keep the best `max_sources` hits at or above `min_confidence`
    async fn retrieve(
        &self,
        query_id: Uuid,
        text: &str,
        options: &QueryOptions,
    ) -> Result<Vec<RetrievedSource>> {
        let embedding = self
            .pipeline
            .provider()
            .embed(text, self.pipeline.model())
            .await?;
        if embedding.len() != self.pipeline.dimension() {
            return Err(RagError::IndexInconsistency(format!(
                "Query embedding has {} dimensions, expected {}",
                embedding.len(),
                self.pipeline.dimension()
            )));
        }

        let mut hits = self
            .index
            .search(
                &embedding,
                options.max_sources.saturating_mul(2),
                options.min_confidence,
            )
            .await?;
        hits.truncate(options.max_sources);

        debug!(
            "[{}] Retrieved {} sources: {:?}",
            query_id,
            hits.len(),
            hits.iter().map(|h| h.chunk_id.as_str()).collect::<Vec<_>>()
        );
        Ok(hits.iter().map(RetrievedSource::from).collect())
    }

    /// Compose the prompt: instruction, prior turns, ranked sources, then the question
    #[inline]
    pub fn build_prompt(
        &self,
        question: &str,
        history: &[ConversationTurn],
        sources: &[RetrievedSource],
    ) -> String {
        let context = build_context(history, sources, self.history_turns);
        let mut prompt = String::with_capacity(context.len() + question.len() + 256);
        prompt.push_str(ANSWER_INSTRUCTION);
        prompt.push_str("\n\n");
        if !context.is_empty() {
            prompt.push_str(&context);
            prompt.push('\n');
        }
        let _ = write!(prompt, "Question: {}\nAnswer:", question);
        prompt
    }

    async fn generate_with_fallback<M: GenerationMode>(
        &self,
        query_id: Uuid,
        prompt: &str,
        options: &QueryOptions,
        mode: M,
    ) -> Result<Generated<M::Output>> {
        let default = self.providers.default_provider();
        let primary = options.provider.as_deref().unwrap_or(default);

        let error = match self
            .attempt(query_id, primary, options.model.as_deref(), prompt, options.timeout, &mode)
            .await
        {
            Ok((output, model)) => {
                return Ok(Generated {
                    output,
                    provider: primary.to_string(),
                    model,
                    fell_back: false,
                });
            }
            Err(e) => e,
        };

        if !error.is_provider_error() || primary == default {
            return Err(error);
        }

        warn!(
            "[{}] Provider {} failed ({}); falling back to {}",
            query_id, primary, error, default
        );
        let (output, model) = self
            .attempt(query_id, default, None, prompt, options.timeout, &mode)
            .await?;

        Ok(Generated {
            output,
            provider: default.to_string(),
            model,
            fell_back: true,
        })
    }

    async fn attempt<M: GenerationMode>(
        &self,
        query_id: Uuid,
        provider_name: &str,
        model: Option<&str>,
        prompt: &str,
        timeout: Option<Duration>,
        mode: &M,
    ) -> Result<(M::Output, String)> {
        let started = Instant::now();
        let provider = match self.providers.get(provider_name) {
            Ok(provider) => provider,
            Err(e) => {
                warn!("[{}] {}", query_id, e);
                self.stats.lock().await.unknown_provider_requests += 1;
                return Err(e);
            }
        };

        let request = GenerationRequest {
            prompt: prompt.to_string(),
            model: model.unwrap_or(provider.default_model()).to_string(),
            max_tokens: self.generation.max_tokens,
            temperature: self.generation.temperature,
        };
        debug!(
            "[{}] Calling provider {} with model {}",
            query_id, provider_name, request.model
        );

        let call = mode.call(provider.as_ref(), &request);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(RagError::transient(
                    provider_name,
                    format!("generation timed out after {:?}", limit),
                ))
            }),
            None => call.await,
        };

        self.record_attempt(provider_name, started.elapsed(), result.is_ok())
            .await;
        result.map(|output| (output, request.model))
    }

    /// Embed documents and bring the index up to date with them
    #[inline]
    pub async fn ingest(&self, documents: &[Document], force_reprocess: bool) -> IngestReport {
        let started = Instant::now();
        let outcomes = self
            .pipeline
            .try_batch_process(documents, self.ingest_concurrency, force_reprocess)
            .await;

        let mut report = IngestReport::default();
        for (document, outcome) in documents.iter().zip(outcomes) {
            let records = match outcome {
                Ok(records) => records,
                Err(e) => {
                    report.failed += 1;
                    report.failures.push((document.id.clone(), e.to_string()));
                    continue;
                }
            };

            if !force_reprocess && self.index.is_current(&document.id, &records).await {
                debug!("Document {} unchanged, skipping", document.id);
                report.skipped += 1;
                continue;
            }

            match self.index.replace_document(&document.id, &records).await {
                Ok(count) => {
                    report.processed += 1;
                    report.embeddings += count;
                }
                Err(e) => {
                    warn!("Failed to index document {}: {}", document.id, e);
                    report.failed += 1;
                    report.failures.push((document.id.clone(), e.to_string()));
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(
            "Ingested {} documents: {} processed, {} skipped, {} failed, {} embeddings in {:?}",
            documents.len(),
            report.processed,
            report.skipped,
            report.failed,
            report.embeddings,
            report.elapsed
        );
        report
    }

    /// Remove a document from the index. Cached embeddings expire on their own.
    #[inline]
    pub async fn remove_document(&self, document_id: &str) -> Result<usize> {
        if document_id.trim().is_empty() {
            return Err(RagError::Validation(
                "Document id must not be empty".to_string(),
            ));
        }
        Ok(self.index.remove(document_id).await)
    }

    #[inline]
    pub async fn stats(&self) -> OrchestratorStats {
        self.stats.lock().await.clone()
    }

    async fn record_query(&self, elapsed: Duration, fell_back: bool) {
        let mut stats = self.stats.lock().await;
        stats.queries_processed += 1;
        if fell_back {
            stats.fallbacks += 1;
        }
        stats.total_time_ms += elapsed.as_secs_f64() * 1000.0;
        stats.average_time_ms = stats.total_time_ms / stats.queries_processed as f64;
    }

    async fn record_attempt(&self, provider: &str, elapsed: Duration, succeeded: bool) {
        let mut stats = self.stats.lock().await;
        let usage = stats.provider_usage.entry(provider.to_string()).or_default();
        usage.requests += 1;
        if !succeeded {
            usage.failures += 1;
        }
        usage.total_ms += elapsed.as_secs_f64() * 1000.0;
        usage.average_ms = usage.total_ms / usage.requests as f64;
    }
}

/// How a generation attempt is made: whole text or an opened stream
trait GenerationMode {
    type Output: Send;

    fn call<'a>(
        &self,
        provider: &'a dyn GenerationProvider,
        request: &'a GenerationRequest,
    ) -> futures::future::BoxFuture<'a, Result<Self::Output>>;
}

struct TextMode;

impl GenerationMode for TextMode {
    type Output = String;

    fn call<'a>(
        &self,
        provider: &'a dyn GenerationProvider,
        request: &'a GenerationRequest,
    ) -> futures::future::BoxFuture<'a, Result<String>> {
        provider.generate(request)
    }
}

struct StreamMode;

impl GenerationMode for StreamMode {
    type Output = GenerationStream;

    fn call<'a>(
        &self,
        provider: &'a dyn GenerationProvider,
        request: &'a GenerationRequest,
    ) -> futures::future::BoxFuture<'a, Result<GenerationStream>> {
        provider.generate_stream(request)
    }
}

/// Render prior turns (oldest first, at most `history_turns`) followed by ranked sources
#[inline]
pub fn build_context(
    history: &[ConversationTurn],
    sources: &[RetrievedSource],
    history_turns: usize,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    let recent = &history[history.len().saturating_sub(history_turns)..];
    if !recent.is_empty() {
        parts.push("=== Previous Conversation ===".to_string());
        for turn in recent {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            parts.push(format!("{}: {}", speaker, turn.content));
        }
        parts.push(String::new());
    }

    if !sources.is_empty() {
        parts.push("=== Relevant Information ===".to_string());
        for (i, source) in sources.iter().enumerate() {
            parts.push(format!("Source {}:", i + 1));
            parts.push(source.record.text.clone());
            parts.push(String::new());
        }
    }

    parts.join("\n")
}

/// Mean similarity of the sources to the query, clamped to [0, 1]; 0 without sources
#[inline]
pub fn confidence(sources: &[RetrievedSource]) -> f32 {
    if sources.is_empty() {
        return 0.0;
    }
    let total: f32 = sources.iter().map(|s| s.score).sum();
    (total / sources.len() as f32).clamp(0.0, 1.0)
}
