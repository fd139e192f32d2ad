//! Ollama Integration Module for weenus.
//!
//! Async client for a locally running Ollama server: model listing, model
//! pulls with streamed progress, and streamed chat completions. Every long
//! request takes an [`AbortSignal`] so the download queue and the streaming
//! coordinator can stop it.
//!
//! # Example
//!
//! ```no_run
//! use weenus::cancel::AbortSignal;
//! use weenus::ollama::OllamaClient;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = OllamaClient::new();
//!
//! if client.is_running().await {
//!     client
//!         .pull_model_with_progress("llama3.2:latest", &AbortSignal::never(), |progress| {
//!             if let Some(pct) = progress.percentage() {
//!                 println!("{}: {:.1}%", progress.status, pct);
//!             }
//!         })
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::AbortSignal;
use crate::download::{DownloadPhase, FetchFuture, FetchProgress, ModelFetcher, ProgressFn};
use crate::types::Message;

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Timeout for connection checks (in seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Timeout for a whole chat request (in seconds).
const GENERATION_TIMEOUT_SECS: u64 = 300;

/// Timeout for a whole model pull (in seconds).
const PULL_TIMEOUT_SECS: u64 = 3600;

/// Error types specific to Ollama operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OllamaError {
    /// Ollama server is not running or unreachable.
    #[error("Ollama is not running: {0}")]
    NotRunning(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    /// Error reported by the Ollama API itself.
    #[error("Ollama API error: {0}")]
    Api(String),
    #[error("Network error: {0}")]
    Network(String),
    /// The caller's abort signal fired.
    #[error("Request cancelled")]
    Cancelled,
}

/// One line of the `/api/pull` progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    /// Current status message.
    pub status: String,
    /// Digest of the layer being downloaded (if applicable).
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    /// Set instead of `status` when the pull fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullProgress {
    /// Calculate download progress as a percentage (0-100).
    pub fn percentage(&self) -> Option<f64> {
        match (self.total, self.completed) {
            (Some(total), Some(completed)) if total > 0 => {
                Some((completed as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<DownloadPhase> {
        pull_phase(&self.status)
    }

    pub fn to_fetch_progress(&self) -> FetchProgress {
        FetchProgress {
            status: self.status.clone(),
            completed: self.completed,
            total: self.total,
            phase: self.phase(),
        }
    }
}

/// Map an `/api/pull` status line to a download phase.
///
/// Layer transfers ("pulling 6a0746a1ec1a") are downloading; digest checks
/// and manifest writes are processing. "pulling manifest" and "success"
/// carry no phase.
pub fn pull_phase(status: &str) -> Option<DownloadPhase> {
    if status == "pulling manifest" {
        None
    } else if status.starts_with("pulling ") {
        Some(DownloadPhase::Downloading)
    } else if status.starts_with("verifying")
        || status.starts_with("writing")
        || status.starts_with("removing")
    {
        Some(DownloadPhase::Processing)
    } else {
        None
    }
}

/// Model information returned from the tags endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Model size in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub modified_at: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// One line of the `/api/chat` stream.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Sampling options sent with a chat request.
///
/// Unset fields are left out of the request so Ollama applies the model's
/// own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl ChatOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// `self` with every field set in `over` replaced by the value from `over`.
    pub fn overlay(&self, over: &ChatOptions) -> ChatOptions {
        ChatOptions {
            temperature: over.temperature.or(self.temperature),
            top_p: over.top_p.or(self.top_p),
            top_k: over.top_k.or(self.top_k),
            repeat_penalty: over.repeat_penalty.or(self.repeat_penalty),
            seed: over.seed.or(self.seed),
            num_predict: over.num_predict.or(self.num_predict),
            stop: if over.stop.is_empty() { self.stop.clone() } else { over.stop.clone() },
        }
    }

    /// Reject values Ollama would refuse or silently clamp.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            anyhow::ensure!((0.0..=2.0).contains(&t), "temperature must be between 0 and 2 (got {})", t);
        }
        if let Some(p) = self.top_p {
            anyhow::ensure!((0.0..=1.0).contains(&p), "top_p must be between 0 and 1 (got {})", p);
        }
        if let Some(k) = self.top_k {
            anyhow::ensure!(k > 0, "top_k must be at least 1");
        }
        if let Some(r) = self.repeat_penalty {
            anyhow::ensure!(r > 0.0, "repeat_penalty must be positive (got {})", r);
        }
        if let Some(n) = self.num_predict {
            anyhow::ensure!(n == -1 || n > 0, "num_predict must be positive or -1 (got {})", n);
        }
        Ok(())
    }
}

/// Body of `POST /api/chat`.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a ChatOptions>,
}

impl<'a> ChatRequest<'a> {
    fn streaming(model: &'a str, messages: &'a [Message], options: &'a ChatOptions) -> Self {
        Self {
            model,
            messages,
            stream: true,
            options: (!options.is_empty()).then_some(options),
        }
    }
}

/// Splits a byte stream into newline-delimited JSON lines.
///
/// Network chunks can end mid-line or mid-character; incomplete bytes are
/// held until the rest arrives.
#[derive(Debug, Default)]
pub struct NdjsonBuffer {
    pending: Vec<u8>,
}

impl NdjsonBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `chunk` and return every line it completed. Blank lines are
    /// dropped and surrounding whitespace trimmed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = Self::decode(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left once the stream ends without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        Self::decode(&rest)
    }

    fn decode(raw: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        (!line.is_empty()).then(|| line.to_string())
    }
}

/// Streamed chat response: one item per content chunk.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Client for interacting with Ollama.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    /// Base URL for the Ollama API.
    base_url: String,
    client: reqwest::Client,
    generation_timeout: Duration,
    pull_timeout: Duration,
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaClient {
    /// Create a client for `http://localhost:11434`.
    pub fn new() -> Self {
        Self::with_url(DEFAULT_OLLAMA_URL)
    }

    /// Create a client for a custom base URL (e.g. "http://gpu-box:11434").
    pub fn with_url(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            base_url: url.into().trim_end_matches('/').to_string(),
            client,
            generation_timeout: Duration::from_secs(GENERATION_TIMEOUT_SECS),
            pull_timeout: Duration::from_secs(PULL_TIMEOUT_SECS),
        }
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if Ollama is running and reachable.
    pub async fn is_running(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);

        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Ollama health check failed");
                false
            }
        }
    }

    /// Names of locally installed models.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        Ok(self
            .list_models_detailed()
            .await?
            .into_iter()
            .map(|m| m.name)
            .collect())
    }

    /// Locally installed models with size and digest.
    pub async fn list_models_detailed(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| self.request_error(e, "Listing models"))?;

        if !response.status().is_success() {
            return Err(OllamaError::Api(format!(
                "Failed to list models: HTTP {}",
                response.status()
            ))
            .into());
        }

        let tags: TagsResponse = response
            .json()
            .await
            .context("Failed to parse model list response")?;
        Ok(tags.models)
    }

    /// Whether `model` is installed. A bare name matches its `:latest` tag.
    pub async fn has_model(&self, model: &str) -> Result<bool> {
        let latest = format!("{}:latest", model);
        Ok(self
            .list_models()
            .await?
            .iter()
            .any(|name| name == model || *name == latest))
    }

    /// Pull (download) a model, reporting each progress line to
    /// `progress_callback`.
    ///
    /// Stops with [`OllamaError::Cancelled`] as soon as `signal` fires. An
    /// `error` line in the stream fails the pull.
    pub async fn pull_model_with_progress<F>(
        &self,
        name: &str,
        signal: &AbortSignal,
        mut progress_callback: F,
    ) -> Result<()>
    where
        F: FnMut(PullProgress),
    {
        let url = format!("{}/api/pull", self.base_url);
        let request = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "name": name, "stream": true }))
            .timeout(self.pull_timeout);

        let response = self.send_abortable(request, signal, "Pull").await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response, name, "Pull").await.into());
        }

        tracing::debug!(model = name, "pull stream opened");
        let mut body = response.bytes_stream();
        let mut lines = NdjsonBuffer::new();

        loop {
            tokio::select! {
                biased;
                _ = signal.aborted() => return Err(OllamaError::Cancelled.into()),
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for line in lines.push(&bytes) {
                            Self::handle_pull_line(name, &line, &mut progress_callback)?;
                        }
                    }
                    Some(Err(e)) => return Err(self.request_error(e, "Pull").into()),
                    None => break,
                },
            }
        }

        if let Some(line) = lines.finish() {
            Self::handle_pull_line(name, &line, &mut progress_callback)?;
        }
        Ok(())
    }

    /// Start a streamed chat completion.
    ///
    /// The returned stream yields content chunks in order and ends when the
    /// model is done or `signal` fires. Dropping it closes the connection.
    /// Empty `options` are left out of the request.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[Message],
        options: &ChatOptions,
        signal: AbortSignal,
    ) -> Result<ChatStream> {
        let url = format!("{}/api/chat", self.base_url);
        let request = self
            .client
            .post(&url)
            .json(&ChatRequest::streaming(model, messages, options))
            .timeout(self.generation_timeout);

        let response = self.send_abortable(request, &signal, "Chat").await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response, model, "Chat").await.into());
        }

        let chunks = decode_chat_stream(response.bytes_stream(), model.to_string());
        Ok(Box::pin(chunks.take_until(signal.into_aborted())))
    }

    async fn send_abortable(
        &self,
        request: reqwest::RequestBuilder,
        signal: &AbortSignal,
        action: &str,
    ) -> std::result::Result<reqwest::Response, OllamaError> {
        tokio::select! {
            biased;
            _ = signal.aborted() => Err(OllamaError::Cancelled),
            sent = request.send() => sent.map_err(|e| self.request_error(e, action)),
        }
    }

    fn request_error(&self, e: reqwest::Error, action: &str) -> OllamaError {
        if e.is_connect() {
            OllamaError::NotRunning(format!(
                "Cannot connect to Ollama at {}. Please ensure Ollama is running with: ollama serve",
                self.base_url
            ))
        } else if e.is_timeout() {
            OllamaError::Timeout(format!("{} request timed out", action))
        } else {
            OllamaError::Network(e.to_string())
        }
    }

    async fn status_error(response: reqwest::Response, model: &str, action: &str) -> OllamaError {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();

        if status == StatusCode::NOT_FOUND || error_text.contains("not found") {
            OllamaError::ModelNotFound(model.to_string())
        } else {
            OllamaError::Api(format!("{} failed: HTTP {} - {}", action, status, error_text))
        }
    }

    fn handle_pull_line<F>(model: &str, line: &str, progress_callback: &mut F) -> Result<()>
    where
        F: FnMut(PullProgress),
    {
        let progress: PullProgress = match serde_json::from_str(line) {
            Ok(progress) => progress,
            Err(e) => {
                tracing::debug!(error = %e, line, "skipping unparseable pull line");
                return Ok(());
            }
        };

        if let Some(error) = progress.error {
            return Err(api_error(model, error).into());
        }
        progress_callback(progress);
        Ok(())
    }
}

impl ModelFetcher for OllamaClient {
    fn fetch<'a>(&'a self, model: &'a str, signal: AbortSignal, mut progress: ProgressFn) -> FetchFuture<'a> {
        Box::pin(async move {
            self.pull_model_with_progress(model, &signal, |p| progress(p.to_fetch_progress()))
                .await
                .with_context(|| format!("Failed to pull {}", model))
        })
    }
}

fn api_error(model: &str, error: String) -> OllamaError {
    if error.contains("not found") {
        OllamaError::ModelNotFound(model.to_string())
    } else {
        OllamaError::Api(error)
    }
}

struct ChatDecoder<S> {
    body: Pin<Box<S>>,
    lines: NdjsonBuffer,
    ready: VecDeque<Result<String>>,
    finished: bool,
    model: String,
}

impl<S> ChatDecoder<S> {
    fn accept(&mut self, line: &str) {
        let chunk: ChatChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, line, "skipping unparseable chat line");
                return;
            }
        };

        if let Some(error) = chunk.error {
            self.finished = true;
            self.ready.push_back(Err(api_error(&self.model, error).into()));
            return;
        }
        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                self.ready.push_back(Ok(message.content));
            }
        }
        if chunk.done {
            self.finished = true;
        }
    }
}

/// Turn a raw `/api/chat` body into a stream of content chunks.
fn decode_chat_stream<S, B, E>(body: S, model: String) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let decoder = ChatDecoder {
        body: Box::pin(body),
        lines: NdjsonBuffer::new(),
        ready: VecDeque::new(),
        finished: false,
        model,
    };

    futures_util::stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(item) = decoder.ready.pop_front() {
                return Some((item, decoder));
            }
            if decoder.finished {
                return None;
            }

            match decoder.body.next().await {
                Some(Ok(bytes)) => {
                    for line in decoder.lines.push(bytes.as_ref()) {
                        if decoder.finished {
                            break;
                        }
                        decoder.accept(&line);
                    }
                }
                Some(Err(e)) => {
                    decoder.finished = true;
                    decoder
                        .ready
                        .push_back(Err(OllamaError::Network(e.to_string()).into()));
                }
                None => {
                    decoder.finished = true;
                    if let Some(line) = decoder.lines.finish() {
                        decoder.accept(&line);
                    }
                }
            }
        }
    })
}
