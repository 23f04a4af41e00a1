//! Embedding service client
//!
//! HTTP client for the external embedding service. Supports single and batch
//! generation with timeouts, exponential-backoff retries, and a circuit
//! breaker: after enough consecutive failures further calls short-circuit
//! with `ServiceUnavailable` until a half-open probe succeeds.
//!
//! The provider is a trait so tests can substitute a deterministic stub.

use crate::error::EngineError;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for the embedding client
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Embedding service URL
    pub service_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum retries on failure (exponential backoff)
    pub max_retries: usize,
    /// Base retry delay in milliseconds (doubles each retry)
    pub retry_delay_ms: u64,
    /// Consecutive failures before the breaker opens
    pub breaker_threshold: u32,
    /// How long the breaker stays open before a half-open probe
    pub breaker_open_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:8888".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 500,
            breaker_threshold: 5,
            breaker_open_secs: 30,
        }
    }
}

/// Provider seam: the engine consumes embeddings through this trait
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate one embedding. Errors map to the §7 taxonomy
    /// (`ServiceUnavailable` / `Timeout`).
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;

    /// Generate embeddings for a batch; per-item None on failure
    async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BreakerState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Counts consecutive failures and short-circuits while open
struct CircuitBreaker {
    state: Mutex<(BreakerState, u32)>,
    threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: Mutex::new((BreakerState::Closed, 0)),
            threshold,
            open_duration,
        }
    }

    /// Whether a call may proceed. Transitions Open -> HalfOpen after the
    /// open window elapses, admitting a single probe.
    fn allow(&self) -> bool {
        let mut guard = self.state.lock();
        match guard.0 {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.open_duration {
                    guard.0 = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut guard = self.state.lock();
        *guard = (BreakerState::Closed, 0);
    }

    fn record_failure(&self) {
        let mut guard = self.state.lock();
        guard.1 += 1;
        if guard.1 >= self.threshold || guard.0 == BreakerState::HalfOpen {
            guard.0 = BreakerState::Open {
                since: Instant::now(),
            };
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state.lock().0, BreakerState::Open { .. })
    }
}

/// Request format for the embedding service API
#[derive(Serialize, Debug)]
struct EmbeddingRequest {
    texts: Vec<String>,
    normalize: bool,
}

/// Response format from the embedding service API
#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    #[allow(dead_code)]
    dimensions: u32,
}

/// HTTP embedding client
pub struct HttpEmbeddingClient {
    config: EmbeddingConfig,
    client: Client,
    breaker: CircuitBreaker,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::ServiceUnavailable(e.to_string()))?;

        let breaker = CircuitBreaker::new(
            config.breaker_threshold,
            Duration::from_secs(config.breaker_open_secs),
        );

        debug!(
            "Embedding client: url={}, timeout={}s",
            config.service_url, config.timeout_secs
        );

        Ok(Self {
            config,
            client,
            breaker,
        })
    }

    pub fn for_service(url: &str) -> Result<Self, EngineError> {
        Self::new(EmbeddingConfig {
            service_url: url.to_string(),
            ..Default::default()
        })
    }

    async fn try_generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let request = EmbeddingRequest {
            texts: texts.to_vec(),
            normalize: true,
        };

        let url = format!("{}/embed", self.config.service_url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(format!("embedding request: {}", e))
                } else {
                    EngineError::ServiceUnavailable(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::OK => {
                let body: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| EngineError::ServiceUnavailable(e.to_string()))?;

                if body.embeddings.len() != texts.len() {
                    return Err(EngineError::ServiceUnavailable(format!(
                        "embedding count mismatch: sent {}, got {}",
                        texts.len(),
                        body.embeddings.len()
                    )));
                }

                Ok(body.embeddings)
            }
            status => Err(EngineError::ServiceUnavailable(format!(
                "embedding service returned {}",
                status
            ))),
        }
    }

    async fn generate_batch_with_retries(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EngineError> {
        if !self.breaker.allow() {
            return Err(EngineError::ServiceUnavailable(
                "embedding circuit breaker open".to_string(),
            ));
        }

        let mut last_error = EngineError::ServiceUnavailable("no attempt made".to_string());

        for attempt in 0..=self.config.max_retries {
            match self.try_generate_batch(texts).await {
                Ok(embeddings) => {
                    self.breaker.record_success();
                    return Ok(embeddings);
                }
                Err(e) => {
                    warn!(
                        "Embedding attempt {}/{} failed: {}",
                        attempt + 1,
                        self.config.max_retries + 1,
                        e
                    );
                    last_error = e;
                    if attempt < self.config.max_retries {
                        let delay = self
                            .config
                            .retry_delay_ms
                            .saturating_mul(2u64.pow(attempt as u32));
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        self.breaker.record_failure();
        Err(last_error)
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open()
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let mut results = self
            .generate_batch_with_retries(&[text.to_string()])
            .await?;
        results
            .pop()
            .ok_or_else(|| EngineError::ServiceUnavailable("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        if texts.is_empty() {
            return Vec::new();
        }
        match self.generate_batch_with_retries(texts).await {
            Ok(embeddings) => embeddings.into_iter().map(Some).collect(),
            Err(e) => {
                warn!("Batch embedding failed: {}", e);
                vec![None; texts.len()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();

        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn test_breaker_half_open_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));

        breaker.record_failure();
        assert!(breaker.is_open());

        // Open window elapsed: one probe allowed
        assert!(breaker.allow());

        // Probe failure reopens immediately
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_breaker_success_resets() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = HttpEmbeddingClient::new(EmbeddingConfig::default());
        assert!(client.is_ok());
    }
}
