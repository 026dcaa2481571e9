#[cfg(test)]
mod tests;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    GenerationProvider, GenerationRequest, GenerationStream, STREAM_BUFFER, StreamEvent,
    http_client, pump_lines, read_text, send_request,
};
use crate::{RagError, Result};

const SSE_DONE: &str = "[DONE]";

/// Client for OpenAI-compatible `/chat/completions` endpoints
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    name: String,
    model: String,
    base_url: Url,
    api_key: Option<String>,
    api_key_env: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    /// Build a client, reading the API key from `api_key_env`.
    ///
    /// A missing key is not an error here; calls report the provider as unavailable.
    #[inline]
    pub fn new(
        name: &str,
        model: &str,
        base_url: &str,
        api_key_env: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = std::env::var(api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        Self::with_api_key(name, model, base_url, api_key_env, api_key, timeout)
    }

    #[inline]
    pub fn with_api_key(
        name: &str,
        model: &str,
        base_url: &str,
        api_key_env: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        // A trailing slash keeps `join` from replacing the last path segment
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|e| {
            RagError::Validation(format!("Invalid base URL for provider {}: {}", name, e))
        })?;

        if api_key.is_none() {
            warn!(
                "Provider {} has no API key; set {} to enable it",
                name, api_key_env
            );
        }

        let client = http_client(name, timeout)?;

        Ok(Self {
            name: name.to_string(),
            model: model.to_string(),
            base_url,
            api_key,
            api_key_env: api_key_env.to_string(),
            client,
        })
    }

    fn completions_url(&self) -> Result<Url> {
        self.base_url.join("chat/completions").map_err(|e| {
            RagError::unavailable(&self.name, format!("Failed to build request URL: {}", e))
        })
    }

    fn authorization(&self) -> Result<String> {
        self.api_key
            .as_ref()
            .map(|key| format!("Bearer {}", key))
            .ok_or_else(|| {
                RagError::unavailable(
                    &self.name,
                    format!("API key not configured ({} is unset)", self.api_key_env),
                )
            })
    }

    async fn post_completion(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let authorization = self.authorization()?;
        let url = self.completions_url()?;
        let body = Self::request_body(request, stream)?;
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", authorization)
            .body(body);
        send_request(&self.name, request).await
    }

    fn request_body(request: &GenerationRequest, stream: bool) -> Result<String> {
        let body = ChatRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        };
        Ok(serde_json::to_string(&body)?)
    }
}

/// Parse one SSE line, returning `None` for lines that carry no event
fn parse_sse_line(provider: &str, line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == SSE_DONE {
        return Some(StreamEvent::Done);
    }

    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => {
            let choice = chunk.choices.into_iter().next()?;
            match choice.delta.content {
                Some(content) if !content.is_empty() => Some(StreamEvent::Fragment(content)),
                _ => {
                    if let Some(reason) = choice.finish_reason {
                        debug!("Provider {} finished: {}", provider, reason);
                    }
                    None
                }
            }
        }
        Err(e) => Some(StreamEvent::Error(format!(
            "malformed stream chunk from {}: {}",
            provider, e
        ))),
    }
}

#[async_trait]
impl GenerationProvider for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        debug!(
            "Requesting completion from {} (model {}, {} prompt bytes)",
            self.name,
            request.model,
            request.prompt.len()
        );

        let response = self.post_completion(request, false).await?;
        let response_text = read_text(&self.name, response).await?;

        let response: ChatResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::transient(&self.name, format!("Failed to parse completion: {}", e))
        })?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RagError::transient(&self.name, "Completion contained no choices"))
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<GenerationStream> {
        let response = self.post_completion(request, true).await?;
        let name = self.name.clone();

        let (sender, stream) = GenerationStream::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let provider = name.clone();
            pump_lines(&name, response.bytes_stream(), &sender, move |line| {
                parse_sse_line(&provider, line).into_iter().collect()
            })
            .await;
        });

        debug!("Opened completion stream from {}", self.name);
        Ok(stream)
    }

    async fn health_check(&self) -> bool {
        let Ok(authorization) = self.authorization() else {
            return false;
        };
        let Ok(url) = self.base_url.join("models") else {
            return false;
        };
        let request = self.client.get(url).header("Authorization", authorization);

        match send_request(&self.name, request).await {
            Ok(_) => {
                info!("Health check passed for provider {}", self.name);
                true
            }
            Err(e) => {
                warn!("Health check failed for provider {}: {}", self.name, e);
                false
            }
        }
    }
}
