#[cfg(test)]
mod tests;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::generation::{
    GenerationProvider, GenerationRequest, GenerationStream, STREAM_BUFFER, StreamEvent,
    http_client, pump_lines, read_text, send_request,
};
use crate::{RagError, Result};

/// Client for an Ollama server, serving both embeddings and generation.
///
/// Requests are made once; failures are classified and returned without retry.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    name: String,
    base_url: Url,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    #[inline]
    pub fn new(name: &str, base_url: Url, model: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url,
            model: model.to_string(),
            client: http_client(name, timeout)?,
        })
    }

    /// Embedding client for the configured endpoint
    #[inline]
    pub fn from_embedding_config(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = config.ollama_url()?;
        Self::new("ollama", base_url, &config.model, config.timeout())
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| {
            RagError::unavailable(&self.name, format!("Failed to build {} URL: {}", path, e))
        })
    }

    async fn post_json(&self, path: &str, body: String) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);
        send_request(&self.name, request).await
    }

    /// List models installed on the server
    #[inline]
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;

        debug!("Fetching available models from {}", url);

        let response = send_request(&self.name, self.client.get(url)).await?;
        let response_text = read_text(&self.name, response).await?;

        let models: ModelsResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::transient(&self.name, format!("Failed to parse models response: {}", e))
        })?;

        debug!("Found {} models", models.models.len());
        Ok(models.models)
    }

    /// Whether `model` is installed, accepting names without an explicit tag
    #[inline]
    pub async fn has_model(&self, model: &str) -> Result<bool> {
        let models = self.list_models().await?;
        let available = models.iter().any(|m| {
            m.name == model || m.name.strip_suffix(":latest").is_some_and(|base| base == model)
        });
        if !available {
            let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
            warn!(
                "Model {} not found on {}. Available models: {:?}",
                model, self.base_url, names
            );
        }
        Ok(available)
    }

    fn generate_body(request: &GenerationRequest, stream: bool) -> Result<String> {
        let body = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream,
            options: GenerateOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            },
        };
        Ok(serde_json::to_string(&body)?)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        debug!(
            "Generating embedding with {} (text length: {})",
            model,
            text.len()
        );

        let body = serde_json::to_string(&EmbedRequest { model, input: text })?;
        let response = self.post_json("/api/embed", body).await?;
        let response_text = read_text(&self.name, response).await?;

        let response: EmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::transient(
                &self.name,
                format!("Failed to parse embedding response: {}", e),
            )
        })?;

        response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RagError::transient(&self.name, "Embedding response was empty"))
    }

    async fn health_check(&self) -> bool {
        match self.has_model(&self.model).await {
            Ok(true) => {
                info!(
                    "Health check passed for Ollama at {} with model {}",
                    self.base_url, self.model
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Health check failed for Ollama at {}: {}", self.base_url, e);
                false
            }
        }
    }
}

#[async_trait]
impl GenerationProvider for OllamaClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        debug!(
            "Requesting generation from {} (model {}, {} prompt bytes)",
            self.name,
            request.model,
            request.prompt.len()
        );

        let body = Self::generate_body(request, false)?;
        let response = self.post_json("/api/generate", body).await?;
        let response_text = read_text(&self.name, response).await?;

        let chunk: GenerateChunk = serde_json::from_str(&response_text).map_err(|e| {
            RagError::transient(&self.name, format!("Failed to parse generation: {}", e))
        })?;
        if let Some(error) = chunk.error {
            return Err(RagError::transient(&self.name, error));
        }
        Ok(chunk.response)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<GenerationStream> {
        let body = Self::generate_body(request, true)?;
        let response = self.post_json("/api/generate", body).await?;
        let name = self.name.clone();

        let (sender, stream) = GenerationStream::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            pump_lines(&name, response.bytes_stream(), &sender, parse_ndjson_line).await;
        });

        debug!("Opened generation stream from {}", self.name);
        Ok(stream)
    }

    async fn health_check(&self) -> bool {
        EmbeddingProvider::health_check(self).await
    }
}

/// Events carried by one NDJSON generation line; a final chunk may still hold text
fn parse_ndjson_line(line: &str) -> Vec<StreamEvent> {
    if line.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<GenerateChunk>(line) {
        Ok(GenerateChunk {
            error: Some(error), ..
        }) => vec![StreamEvent::Error(error)],
        Ok(chunk) if chunk.done => {
            let mut events = Vec::with_capacity(2);
            if !chunk.response.is_empty() {
                events.push(StreamEvent::Fragment(chunk.response));
            }
            events.push(StreamEvent::Done);
            events
        }
        Ok(chunk) => vec![StreamEvent::Fragment(chunk.response)],
        Err(e) => vec![StreamEvent::Error(format!("malformed stream chunk: {}", e))],
    }
}
