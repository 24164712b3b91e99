//! The single outbound gateway to the embedding and generative models.
//!
//! Every provider request passes through one bounded FIFO queue whose worker
//! enforces a minimum inter-request spacing (default 6.5 s, sized for a
//! small-tier quota of roughly 9 requests/minute). Enqueueing fails fast with
//! `ModelQueueFull` when capacity is exhausted; each request carries a
//! deadline after which the caller observes `ModelTimeout`.
//!
//! Two throttling mechanisms coexist on purpose: the queue enforces
//! *proactive* spacing to avoid 429s, while the retry policy handles
//! *incidental* transients (5xx, connection resets). Rate-limit responses are
//! never retried; a provider retry-after hint is honored as a one-off extra
//! delay before the next request is released.
//!
//! This module is the only place that knows provider-specific error shapes.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::ModelConfig;
use crate::error::{RagError, Result};

/// Temperature ceiling for generation. Part of the grounding contract, not a
/// tunable a caller can raise.
pub const MAX_TEMPERATURE: f32 = 0.2;
/// Output length ceiling for generation.
pub const MAX_OUTPUT_TOKENS: u32 = 2048;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Generation parameters, clamped to the safety ceilings at dispatch.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// A model provider: embeddings plus text generation.
///
/// Implementations map their wire-level failures onto the service error
/// taxonomy; nothing outside this module sees provider error shapes.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    /// Embedding dimensionality, fixed per corpus.
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    async fn generate(&self, system: &str, user: &str, params: &GenerationParams)
        -> Result<String>;
}

enum Request {
    Embed {
        texts: Vec<String>,
        reply: oneshot::Sender<Result<Vec<Vec<f32>>>>,
    },
    Generate {
        system: String,
        user: String,
        params: GenerationParams,
        reply: oneshot::Sender<Result<String>>,
    },
}

struct Queued {
    request: Request,
    deadline: Instant,
}

impl Queued {
    fn reject_timeout(self) {
        match self.request {
            Request::Embed { reply, .. } => {
                let _ = reply.send(Err(RagError::ModelTimeout));
            }
            Request::Generate { reply, .. } => {
                let _ = reply.send(Err(RagError::ModelTimeout));
            }
        }
    }
}

/// Handle to the model request queue. Cheap to clone.
#[derive(Clone)]
pub struct ModelClient {
    tx: mpsc::Sender<Queued>,
    dims: usize,
    request_timeout: Duration,
}

impl ModelClient {
    /// Spawn the queue worker and return the client handle.
    pub fn new(provider: Arc<dyn Provider>, config: &ModelConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let dims = provider.dims();

        let worker = Worker {
            provider,
            min_interval: Duration::from_millis(config.min_interval_ms),
            max_retries: config.max_retries,
        };
        tokio::spawn(worker.run(rx));

        Self {
            tx,
            dims,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    /// Embedding dimensionality of the configured provider.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed a single text (the query path).
    pub async fn embed_one(&self, text: String) -> Result<Vec<f32>> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Embed {
            texts: vec![text],
            reply,
        })?;
        let vectors = self.await_reply(rx).await??;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Internal("empty embedding response".to_string()))
    }

    /// Embed several texts with per-item outcomes, aligned by index.
    ///
    /// Each text is its own queue entry; the entries are submitted
    /// concurrently and serialize through the worker in FIFO order.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Vec<Result<Vec<f32>>> {
        let futures: Vec<_> = texts
            .into_iter()
            .map(|text| self.embed_one(text))
            .collect();
        futures::future::join_all(futures).await
    }

    /// Generate text. Temperature and output length are clamped to the
    /// safety ceilings regardless of the requested values.
    pub async fn generate(
        &self,
        system: &str,
        user: &str,
        params: GenerationParams,
    ) -> Result<String> {
        let clamped = GenerationParams {
            temperature: params.temperature.min(MAX_TEMPERATURE),
            max_output_tokens: params.max_output_tokens.min(MAX_OUTPUT_TOKENS),
        };

        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Generate {
            system: system.to_string(),
            user: user.to_string(),
            params: clamped,
            reply,
        })?;
        self.await_reply(rx).await?
    }

    fn enqueue(&self, request: Request) -> Result<()> {
        let queued = Queued {
            request,
            deadline: Instant::now() + self.request_timeout,
        };
        self.tx.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RagError::ModelQueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                RagError::Internal("model worker stopped".to_string())
            }
        })
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<Result<T>>) -> Result<Result<T>> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => Err(RagError::ModelTimeout),
            Ok(Err(_)) => Err(RagError::Internal("model worker dropped reply".to_string())),
            Ok(Ok(result)) => Ok(result),
        }
    }
}

struct Worker {
    provider: Arc<dyn Provider>,
    min_interval: Duration,
    max_retries: u32,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Queued>) {
        let mut next_dispatch = Instant::now();

        while let Some(queued) = rx.recv().await {
            if Instant::now() >= queued.deadline {
                queued.reject_timeout();
                continue;
            }

            tokio::time::sleep_until(next_dispatch).await;

            if Instant::now() >= queued.deadline {
                queued.reject_timeout();
                continue;
            }

            let extra_delay = self.dispatch(queued.request).await;
            next_dispatch = Instant::now() + self.min_interval + extra_delay;
        }
    }

    /// Execute one request with the retry policy. Returns the one-off extra
    /// delay the queue must honor before releasing the next request.
    async fn dispatch(&self, request: Request) -> Duration {
        match request {
            Request::Embed { texts, reply } => {
                let (result, extra) = self.with_retry(|| self.provider.embed(&texts)).await;
                let _ = reply.send(result);
                extra
            }
            Request::Generate {
                system,
                user,
                params,
                reply,
            } => {
                let (result, extra) = self
                    .with_retry(|| self.provider.generate(&system, &user, &params))
                    .await;
                let _ = reply.send(result);
                extra
            }
        }
    }

    /// Retry only transient failures, with exponential backoff capped at 30 s.
    /// Rate-limit errors return immediately, carrying their hint out as the
    /// queue's extra delay.
    async fn with_retry<T, F, Fut>(&self, operation: F) -> (Result<T>, Duration)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return (Ok(value), Duration::ZERO),
                Err(RagError::ModelRateLimited { retry_after }) => {
                    let extra = retry_after.unwrap_or(Duration::ZERO).min(BACKOFF_CAP);
                    tracing::warn!(
                        provider = self.provider.name(),
                        extra_delay_ms = extra.as_millis() as u64,
                        "provider rate limited; spacing out next request"
                    );
                    return (Err(RagError::ModelRateLimited { retry_after }), extra);
                }
                Err(RagError::ModelTransient(message)) if attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        provider = self.provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient model failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return (Err(err), Duration::ZERO),
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(5));
    exp.min(BACKOFF_CAP)
}

/// Instantiate the provider named in the configuration.
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn Provider>> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiProvider::new(config)?)),
        "mock" => Ok(Arc::new(MockProvider::new())),
        other => Err(RagError::Internal(format!(
            "unknown model provider: {other}"
        ))),
    }
}

// ============ Gemini provider ============

/// Provider speaking the Generative Language REST API.
///
/// Requires the `GEMINI_API_KEY` environment variable.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    embed_model: String,
    gen_model: String,
}

/// Dimensionality of the text-embedding-004 family.
const GEMINI_EMBED_DIMS: usize = 768;

impl GeminiProvider {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| RagError::Internal("GEMINI_API_KEY environment variable not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| RagError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            embed_model: config.embed_model.clone(),
            gen_model: config.gen_model.clone(),
        })
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| RagError::Internal(format!("invalid provider response: {e}")));
        }

        if status.as_u16() == 429 {
            let retry_after = parse_retry_after(response.headers());
            return Err(RagError::ModelRateLimited { retry_after });
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(RagError::ModelTransient(format!(
                "provider returned {status}: {body_text}"
            )))
        } else {
            Err(RagError::Internal(format!(
                "provider returned {status}: {body_text}"
            )))
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn dims(&self) -> usize {
        GEMINI_EMBED_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/models/{}:batchEmbedContents",
            self.base_url, self.embed_model
        );
        let requests: Vec<_> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.embed_model),
                    "content": { "parts": [{ "text": text }] },
                })
            })
            .collect();

        let response = self.post_json(&url, json!({ "requests": requests })).await?;
        parse_embeddings(&response)
    }

    async fn generate(
        &self,
        system: &str,
        user: &str,
        params: &GenerationParams,
    ) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.gen_model);
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": user }] }],
            "generationConfig": {
                "temperature": params.temperature,
                "maxOutputTokens": params.max_output_tokens,
            },
        });

        let response = self.post_json(&url, body).await?;
        parse_generated_text(&response)
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> RagError {
    if e.is_timeout() || e.is_connect() {
        RagError::ModelTransient(e.to_string())
    } else {
        RagError::Internal(e.to_string())
    }
}

fn parse_embeddings(response: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = response
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| RagError::Internal("provider response missing embeddings".into()))?;

    embeddings
        .iter()
        .map(|item| {
            let values = item
                .get("values")
                .and_then(|v| v.as_array())
                .ok_or_else(|| RagError::Internal("embedding entry missing values".into()))?;
            Ok(values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

fn parse_generated_text(response: &serde_json::Value) -> Result<String> {
    let text = response
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .ok_or_else(|| RagError::Internal("provider response missing candidates".into()))?;

    Ok(text)
}

/// Parse a Retry-After header: seconds, fractional `0.5s`, or absent.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after").and_then(|v| v.to_str().ok())?;

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Some(stripped) = value.strip_suffix('s') {
        if let Ok(secs) = stripped.parse::<f64>() {
            return Some(Duration::from_secs_f64(secs));
        }
    }
    Some(Duration::from_secs(5))
}

// ============ Mock provider ============

/// Deterministic offline provider for tests and local development.
///
/// Embeddings are bag-of-words vectors: each lowercased word hashes to a
/// bucket, so texts sharing vocabulary score high cosine similarity and the
/// exact same text embeds to the exact same vector. Generation returns a
/// scripted response, or a citing stub by default.
pub struct MockProvider {
    dims: usize,
    calls: std::sync::Mutex<Vec<Instant>>,
    generation_response: std::sync::Mutex<Option<String>>,
    fail_embeds_containing: std::sync::Mutex<Option<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            dims: 256,
            calls: std::sync::Mutex::new(Vec::new()),
            generation_response: std::sync::Mutex::new(None),
            fail_embeds_containing: std::sync::Mutex::new(None),
        }
    }

    /// Timestamps of every provider call, in dispatch order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }

    /// Script the next generations to return this exact text.
    pub fn set_generation_response(&self, text: impl Into<String>) {
        *self.generation_response.lock().unwrap() = Some(text.into());
    }

    /// Make embed calls fail when the input text contains `marker`.
    pub fn fail_embeds_containing(&self, marker: impl Into<String>) {
        *self.fail_embeds_containing.lock().unwrap() = Some(marker.into());
    }

    pub fn clear_embed_failures(&self) {
        *self.fail_embeds_containing.lock().unwrap() = None;
    }

    fn record_call(&self) {
        self.calls.lock().unwrap().push(Instant::now());
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let bucket = word_bucket(&word, self.dims);
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn word_bucket(word: &str, dims: usize) -> usize {
    // FNV-1a keeps the mock free of hash-seed randomness across runs.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % dims as u64) as usize
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.record_call();
        if let Some(marker) = self.fail_embeds_containing.lock().unwrap().as_deref() {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(RagError::Internal("scripted mock embed failure".into()));
            }
        }
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    async fn generate(
        &self,
        _system: &str,
        _user: &str,
        _params: &GenerationParams,
    ) -> Result<String> {
        self.record_call();
        let scripted = self.generation_response.lock().unwrap().clone();
        Ok(scripted.unwrap_or_else(|| {
            "[SOURCE 1] According to the onboarding materials, see the cited source.".to_string()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn fast_config() -> ModelConfig {
        ModelConfig {
            provider: "mock".to_string(),
            queue_capacity: 10,
            min_interval_ms: 200,
            request_timeout_ms: 10_000,
            max_retries: 0,
            ..Default::default()
        }
    }

    fn params() -> GenerationParams {
        GenerationParams {
            temperature: 0.2,
            max_output_tokens: 1024,
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn consecutive_dispatches_respect_min_interval() {
        let provider = Arc::new(MockProvider::new());
        let client = ModelClient::new(provider.clone(), &fast_config());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.generate("system", "user", params()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let times = provider.call_times();
        assert_eq!(times.len(), 5);
        for pair in times.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(
                gap >= Duration::from_millis(200),
                "dispatch gap {gap:?} below minimum interval"
            );
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn queue_overflow_fails_fast() {
        let mut config = fast_config();
        config.queue_capacity = 2;
        config.min_interval_ms = 60_000;
        let provider = Arc::new(MockProvider::new());
        let client = ModelClient::new(provider, &config);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.generate("system", "user", params()).await
            }));
        }

        let mut queue_full = 0;
        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Err(RagError::ModelQueueFull) => queue_full += 1,
                Err(RagError::ModelTimeout) | Ok(_) => accepted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(queue_full >= 1, "expected at least one ModelQueueFull");
        assert!(accepted >= 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn queued_requests_time_out_at_their_deadline() {
        let mut config = fast_config();
        config.min_interval_ms = 10_000;
        config.request_timeout_ms = 1_000;
        let provider = Arc::new(MockProvider::new());
        let client = ModelClient::new(provider, &config);

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.generate("s", "u", params()).await })
        };
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.generate("s", "u", params()).await })
        };

        assert!(first.await.unwrap().is_ok());
        let err = second.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "model_timeout");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn transient_failures_are_retried_rate_limits_are_not() {
        struct FlakyProvider {
            attempts: std::sync::Mutex<u32>,
        }

        #[async_trait]
        impl Provider for FlakyProvider {
            fn name(&self) -> &str {
                "flaky"
            }
            fn dims(&self) -> usize {
                4
            }
            async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                if *attempts < 3 {
                    return Err(RagError::ModelTransient("503".into()));
                }
                Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
            }
            async fn generate(
                &self,
                _s: &str,
                _u: &str,
                _p: &GenerationParams,
            ) -> Result<String> {
                Err(RagError::ModelRateLimited {
                    retry_after: Some(Duration::from_secs(2)),
                })
            }
        }

        let mut config = fast_config();
        config.max_retries = 3;
        let provider = Arc::new(FlakyProvider {
            attempts: std::sync::Mutex::new(0),
        });
        let client = ModelClient::new(provider.clone(), &config);

        let vector = client.embed_one("hello".to_string()).await.unwrap();
        assert_eq!(vector.len(), 4);
        assert_eq!(*provider.attempts.lock().unwrap(), 3);

        let err = client.generate("s", "u", params()).await.unwrap_err();
        assert_eq!(err.kind(), "model_rate_limited");
    }

    #[tokio::test]
    async fn mock_embeddings_are_deterministic_and_word_sensitive() {
        let provider = MockProvider::new();
        let a = provider.embed_text("company holidays include paid holidays");
        let b = provider.embed_text("company holidays include paid holidays");
        assert_eq!(a, b);

        let dot = |x: &[f32], y: &[f32]| -> f32 { x.iter().zip(y).map(|(p, q)| p * q).sum() };
        let query = provider.embed_text("What are the company holidays?");
        let unrelated = provider.embed_text("What is the capital of France?");
        assert!(dot(&query, &a) > dot(&unrelated, &a));
        assert!((dot(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }
}
