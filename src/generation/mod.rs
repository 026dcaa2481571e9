// Generation module
// Text generation capability, cancellable fragment streams, and vendor adapters

pub mod openai;
pub mod registry;

#[cfg(test)]
mod tests;

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{RagError, Result};

pub use openai::OpenAiClient;
pub use registry::{ProviderRegistry, ProviderSettings};

/// Fragments buffered between a streaming producer and its consumer
pub const STREAM_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// One item of a generation stream; `Done` and `Error` are terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Done,
    Error(String),
}

/// Ordered stream of generated fragments ending in an explicit sentinel.
///
/// Dropping the stream closes the channel, which stops the producer at its
/// next send.
#[derive(Debug)]
pub struct GenerationStream {
    receiver: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl GenerationStream {
    #[inline]
    pub fn channel(buffer: usize) -> (mpsc::Sender<StreamEvent>, Self) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (
            sender,
            Self {
                receiver,
                finished: false,
            },
        )
    }

    /// A stream that yields `text` as a single fragment and completes
    #[inline]
    pub fn from_text(text: String) -> Self {
        let (sender, stream) = Self::channel(2);
        if !text.is_empty() {
            let _ = sender.try_send(StreamEvent::Fragment(text));
        }
        let _ = sender.try_send(StreamEvent::Done);
        stream
    }

    /// Next event, or `None` once a terminal event has been yielded.
    ///
    /// A producer that disappears without a sentinel surfaces as an `Error`.
    #[inline]
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.receiver.recv().await.unwrap_or_else(|| {
            StreamEvent::Error("stream ended without a completion marker".to_string())
        });
        if !matches!(event, StreamEvent::Fragment(_)) {
            self.finished = true;
            self.receiver.close();
        }
        Some(event)
    }

    /// Drain the stream into a single string
    #[inline]
    pub async fn collect_text(mut self, provider: &str) -> Result<String> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Fragment(fragment) => text.push_str(&fragment),
                StreamEvent::Done => return Ok(text),
                StreamEvent::Error(message) => return Err(RagError::transient(provider, message)),
            }
        }
        Ok(text)
    }
}

/// Capability that turns a prompt into text
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Registered provider name
    fn name(&self) -> &str;

    /// Model used when a request does not name one
    fn default_model(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Open a fragment stream. Errors returned here happen before any
    /// fragment is produced.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<GenerationStream> {
        let text = self.generate(request).await?;
        Ok(GenerationStream::from_text(text))
    }

    async fn health_check(&self) -> bool;
}

/// HTTP client shared by a provider's requests; `timeout` bounds each whole request
#[inline]
pub fn http_client(provider: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RagError::unavailable(provider, format!("Failed to build HTTP client: {}", e)))
}

/// Map an HTTP status to the provider error taxonomy
#[inline]
pub fn classify_status(provider: &str, status: u16) -> RagError {
    match status {
        429 | 500..=599 => {
            warn!("Provider {} returned HTTP {}", provider, status);
            RagError::transient(provider, format!("HTTP {}", status))
        }
        _ => RagError::unavailable(provider, format!("HTTP {}", status)),
    }
}

/// Map a transport error to the provider error taxonomy
#[inline]
pub fn classify_http_error(provider: &str, error: &reqwest::Error) -> RagError {
    if let Some(status) = error.status() {
        return classify_status(provider, status.as_u16());
    }
    let message = error.to_string();
    if error.is_connect() || error.is_builder() {
        return RagError::unavailable(provider, message);
    }
    if !error.is_timeout() {
        debug!("Unclassified transport error from {}: {}", provider, message);
    }
    RagError::transient(provider, message)
}

/// Send a request and reject non-success statuses.
///
/// Dropping the returned future aborts the request and closes its connection.
#[inline]
pub async fn send_request(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_http_error(provider, &e))?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(classify_status(provider, status.as_u16()))
    }
}

/// Read a successful response body as text
#[inline]
pub async fn read_text(provider: &str, response: reqwest::Response) -> Result<String> {
    response
        .text()
        .await
        .map_err(|e| classify_http_error(provider, &e))
}

/// Forward events parsed from a line-delimited body until a terminal event,
/// the end of the body, or the consumer dropping its stream.
///
/// `parse_line` sees each line without its terminator. Once the consumer is
/// gone the body is dropped, which closes the connection.
#[inline]
pub async fn pump_lines<S, B, E, F>(
    provider: &str,
    body: S,
    sender: &mpsc::Sender<StreamEvent>,
    mut parse_line: F,
) where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(&str) -> Vec<StreamEvent>,
{
    let mut body = std::pin::pin!(body);
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            () = sender.closed() => {
                debug!("Stream consumer for {} went away", provider);
                return;
            }
        };

        match chunk {
            Some(Ok(bytes)) => {
                buffer.extend_from_slice(bytes.as_ref());
                while let Some(end) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=end).collect();
                    let line = String::from_utf8_lossy(&line);
                    if forward(provider, sender, parse_line(line.trim_end())).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = sender
                    .send(StreamEvent::Error(format!(
                        "stream from {} interrupted: {}",
                        provider, e
                    )))
                    .await;
                return;
            }
            None => break,
        }
    }

    if !buffer.is_empty() {
        let line = String::from_utf8_lossy(&buffer).into_owned();
        if forward(provider, sender, parse_line(line.trim_end())).await {
            return;
        }
    }

    let _ = sender
        .send(StreamEvent::Error(format!(
            "stream from {} ended before completion",
            provider
        )))
        .await;
}

/// Send events in order, returning `true` once the stream is finished
async fn forward(provider: &str, sender: &mpsc::Sender<StreamEvent>, events: Vec<StreamEvent>) -> bool {
    for event in events {
        let terminal = !matches!(event, StreamEvent::Fragment(_));
        if sender.send(event).await.is_err() {
            debug!("Stream consumer for {} went away", provider);
            return true;
        }
        if terminal {
            return true;
        }
    }
    false
}
