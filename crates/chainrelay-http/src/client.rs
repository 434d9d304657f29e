//! HTTP JSON-RPC endpoint backed by `reqwest`.
//!
//! Features:
//! - Single, batch and typed calls with request id allocation
//! - HTTP 429 surfaced as [`TransportError::RateLimited`] so the pool can
//!   pace the endpoint
//! - Transport-level retry of transient errors, paced by a backoff registry
//!   private to this endpoint
//! - Configurable lightweight health method for the pool's probe loop

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainrelay_core::{
    BackoffConfig, BackoffRegistry, Endpoint, JsonRpcRequest, JsonRpcResponse, Protocol, RetryConfig,
    TransportError,
};

/// Configuration for [`HttpEndpoint`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpEndpointConfig {
    /// Deadline for one HTTP round trip.
    #[serde(rename = "request_timeout_ms", with = "chainrelay_core::config::millis")]
    pub request_timeout: Duration,
    /// Transport-level retries after the first attempt.
    pub max_retries: u32,
    /// JSON-RPC method used as the liveness probe.
    pub health_method: String,
    /// Base delays between transport-level retries.
    pub retry: RetryConfig,
    /// Cool-down bounds for the endpoint's own backoff registry.
    pub backoff: BackoffConfig,
}

impl Default for HttpEndpointConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            health_method: "health".into(),
            retry: RetryConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// One JSON-RPC node reachable over HTTP.
pub struct HttpEndpoint {
    url: String,
    http: reqwest::Client,
    config: HttpEndpointConfig,
    backoff: BackoffRegistry,
    next_id: AtomicU64,
}

impl HttpEndpoint {
    /// Create an endpoint for the given JSON-RPC URL.
    pub fn new(url: impl Into<String>, config: HttpEndpointConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            backoff: BackoffRegistry::new(config.backoff.clone()),
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, HttpEndpointConfig::default())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &HttpEndpointConfig {
        &self.config
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one request, retrying transient failures.
    pub async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.with_retry(&req.method, || self.post::<_, JsonRpcResponse>(&req))
            .await
    }

    /// Send all requests as a JSON array in one HTTP call.
    ///
    /// Responses come back in request order; nodes are free to answer a
    /// batch in any order.
    pub async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }

        let mut responses = self
            .with_retry("batch", || self.post::<_, Vec<JsonRpcResponse>>(&reqs))
            .await?;
        responses.sort_by_key(|resp| {
            reqs.iter()
                .position(|req| req.id == resp.id)
                .unwrap_or(usize::MAX)
        });
        Ok(responses)
    }

    /// Call `method` and deserialize its result.
    ///
    /// A node-side error comes back as [`TransportError::Rpc`].
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, TransportError> {
        let req = JsonRpcRequest::with_params(self.next_id(), method, params);
        let value = self
            .send(req)
            .await?
            .into_result()
            .map_err(TransportError::Rpc)?;
        Ok(serde_json::from_value(value)?)
    }

    async fn with_retry<T, F, Fut>(&self, method: &str, mut attempt_once: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match attempt_once().await {
                Ok(value) => {
                    self.backoff.clear(&self.url);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self
                        .backoff
                        .penalize_and_get_delay(&self.url, self.config.retry.exponential_base(attempt));
                    tracing::warn!(
                        attempt,
                        method,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        url = %self.url,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::debug!(attempt, method, error = %e, url = %self.url, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn post<B, T>(&self, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(&self.url, status, &body));
        }

        let bytes = resp.bytes().await.map_err(|e| self.map_reqwest_error(e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::timeout(self.config.request_timeout)
        } else {
            TransportError::Http(e.to_string())
        }
    }
}

/// Map a non-2xx status onto the transport error taxonomy.
fn status_error(url: &str, status: StatusCode, body: &str) -> TransportError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        TransportError::RateLimited {
            endpoint: url.to_string(),
        }
    } else {
        TransportError::Http(format!("HTTP {}: {body}", status.as_u16()))
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    fn identity(&self) -> &str {
        &self.url
    }

    fn protocol(&self) -> Protocol {
        Protocol::JsonRpcHttp
    }

    /// One un-retried call of the health method; the pool owns the deadline
    /// and the retry policy for probes.
    async fn health_check(&self) -> Result<(), TransportError> {
        let req = JsonRpcRequest::with_params(self.next_id(), &self.config.health_method, Value::Null);
        let outcome = self
            .post::<_, JsonRpcResponse>(&req)
            .await
            .and_then(|resp| resp.into_result().map_err(TransportError::Rpc));
        outcome.map(|_| ()).map_err(|e| TransportError::HealthCheck {
            endpoint: self.url.clone(),
            reason: e.to_string(),
        })
    }

    fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

impl std::fmt::Debug for HttpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEndpoint")
            .field("url", &self.url)
            .field("max_retries", &self.config.max_retries)
            .finish()
    }
}
