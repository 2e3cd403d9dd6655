//! HTTP/2 provider client (C3): the sole path by which the compute engine
//! talks to the configured model provider. Builds a shared `reqwest::Client`
//! with a large per-host connection pool and HTTP/2 enabled, and wraps every
//! call in the retry/backoff/health-tracking policy from SS4.3.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::health::HealthTracker;
use crate::rate_limiter::RateLimiter;

const ANALYSIS_OP: &str = "analysis";
const EMBEDDING_OP: &str = "embedding";

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_output_tokens: 4096, temperature: 0.2 }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzeResponse {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub values: Vec<f32>,
    pub dimension: usize,
}

pub struct ProviderClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    max_attempts: u32,
}

impl ProviderClient {
    /// `idle_timeout` bounds how long a pooled connection is kept alive;
    /// `call_timeout` bounds a single request/response round trip.
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        call_timeout: Duration,
        idle_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(idle_timeout)
            .build()
            .map_err(ProviderError::Http)?;

        Ok(Self {
            http,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Run a single analysis prompt against `model`, blocking on `limiter`
    /// for pacing and recording the outcome in `health` under the
    /// "analysis" operation. `cancel` is honored at every suspension point
    /// (the rate-limiter wait, the retry backoff sleep, and the request
    /// itself) so a shutting-down caller doesn't wait out a full retry loop.
    pub async fn analyze(
        &self,
        limiter: &RateLimiter,
        health: &HealthTracker,
        model: &str,
        prompt: &str,
        generation_config: &GenerationConfig,
        cancel: &CancellationToken,
    ) -> Result<AnalyzeResponse, ProviderError> {
        self.with_retries(limiter, health, ANALYSIS_OP, cancel, || {
            self.analyze_once(model, prompt, generation_config)
        })
        .await
    }

    async fn analyze_once(
        &self,
        model: &str,
        prompt: &str,
        generation_config: &GenerationConfig,
    ) -> Result<AnalyzeResponse, ProviderError> {
        let url = format!("{}/v1beta/models/{}:generateContent?key={}", self.base_url, model, self.api_key);
        let body = GenerateContentRequest {
            contents: vec![Content { parts: vec![Part { text: prompt.to_string() }] }],
            generation_config: GenerationConfigWire {
                max_output_tokens: generation_config.max_output_tokens,
                temperature: generation_config.temperature,
            },
        };

        debug!(model, "sending analysis request");
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status().as_u16();

        if status == 429 {
            return Err(retry_after_error(&resp));
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider returned an error");
            return Err(ProviderError::Api { status, message: text });
        }

        let parsed: GenerateContentResponse =
            resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;

        if let Some(feedback) = parsed.prompt_feedback {
            if let Some(reason) = feedback.block_reason {
                return Err(ProviderError::Blocked {
                    reason: reason.clone(),
                    message: format!("prompt blocked by provider safety filter: {reason}"),
                });
            }
        }

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("no candidates in response".to_string()))?;

        if let Some(reason) = candidate.finish_reason.as_deref() {
            if reason == "SAFETY" || reason == "PROHIBITED_CONTENT" {
                return Err(ProviderError::Blocked {
                    reason: reason.to_string(),
                    message: "response blocked by provider safety filter".to_string(),
                });
            }
        }

        let text = candidate
            .content
            .parts
            .into_iter()
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(AnalyzeResponse { text, model: model.to_string() })
    }

    /// Embed a batch of inputs, returning results in request order.
    pub async fn batch_embed(
        &self,
        limiter: &RateLimiter,
        health: &HealthTracker,
        model: &str,
        contents: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<EmbeddingResult>, ProviderError> {
        self.with_retries(limiter, health, EMBEDDING_OP, cancel, || self.batch_embed_once(model, contents))
            .await
    }

    async fn batch_embed_once(&self, model: &str, contents: &[String]) -> Result<Vec<EmbeddingResult>, ProviderError> {
        let url = format!("{}/v1beta/models/{}:batchEmbedContents?key={}", self.base_url, model, self.api_key);
        let requests: Vec<EmbedContentRequest> = contents
            .iter()
            .map(|text| EmbedContentRequest {
                model: format!("models/{model}"),
                content: Content { parts: vec![Part { text: text.clone() }] },
            })
            .collect();
        let body = BatchEmbedContentsRequest { requests };

        debug!(model, count = contents.len(), "sending embedding batch");
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status().as_u16();

        if status == 429 {
            return Err(retry_after_error(&resp));
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider returned an error");
            return Err(ProviderError::Api { status, message: text });
        }

        let parsed: BatchEmbedContentsResponse =
            resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;

        if parsed.embeddings.len() < contents.len() {
            return Err(ProviderError::MissingEmbedding { index: parsed.embeddings.len() });
        }

        Ok(parsed
            .embeddings
            .into_iter()
            .map(|e| EmbeddingResult { dimension: e.values.len(), values: e.values })
            .collect())
    }

    async fn with_retries<F, Fut, T>(
        &self,
        limiter: &RateLimiter,
        health: &HealthTracker,
        operation: &str,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            limiter.wait(cancel).await;
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let start = Instant::now();
            let attempt_result = tokio::select! {
                res = attempt_fn() => res,
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            };
            match attempt_result {
                Ok(value) => {
                    health.record_success(operation, start.elapsed().as_millis() as u64);
                    return Ok(value);
                }
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(err) => {
                    health.record_error(operation, &err);
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = backoff_delay(attempt, &err);
                    debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "retrying provider call");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    }
                }
            }
        }
    }
}

fn retry_after_error(resp: &reqwest::Response) -> ProviderError {
    let retry_after_ms = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs * 1000)
        .unwrap_or(5000);
    ProviderError::RateLimited { retry_after_ms }
}

/// Jittered exponential backoff, capped at 30s, honoring a 429's
/// `retry_after_ms` as a floor when present.
fn backoff_delay(attempt: u32, err: &ProviderError) -> Duration {
    let base_ms = 250u64.saturating_mul(1u64 << attempt.min(7));
    let capped_ms = base_ms.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=capped_ms / 4 + 1);
    let computed = Duration::from_millis(capped_ms + jitter);
    if let ProviderError::RateLimited { retry_after_ms } = err {
        computed.max(Duration::from_millis(*retry_after_ms))
    } else {
        computed
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfigWire,
}

#[derive(Debug, Serialize)]
struct GenerationConfigWire {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedContentRequest {
    model: String,
    content: Content,
}

#[derive(Debug, Serialize)]
struct BatchEmbedContentsRequest {
    requests: Vec<EmbedContentRequest>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedContentsResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingWire>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingWire {
    values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_http2_and_pool_settings() {
        let client = ProviderClient::new(
            "test-key".to_string(),
            None,
            Duration::from_secs(30),
            Duration::from_secs(60),
            5,
        );
        assert!(client.is_ok());
    }

    #[test]
    fn backoff_honors_retry_after_floor() {
        let err = ProviderError::RateLimited { retry_after_ms: 10_000 };
        let delay = backoff_delay(1, &err);
        assert!(delay >= Duration::from_millis(10_000));
    }

    #[test]
    fn backoff_grows_with_attempt_and_is_capped() {
        let err = ProviderError::Unavailable("x".to_string());
        let small = backoff_delay(1, &err);
        let large = backoff_delay(6, &err);
        assert!(large >= small);
        assert!(large <= Duration::from_millis(30_000 + 30_000 / 4 + 1));
    }
}
