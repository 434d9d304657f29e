//! Transport- and pool-level error types.

use std::time::Duration;

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors a single endpoint can produce while executing an operation.
///
/// The retry driver records these against the endpoint's health and backoff
/// state; they only reach the caller wrapped in
/// [`PoolError::AllEndpointsExhausted`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, bad status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// The endpoint told us to slow down.
    #[error("Rate limit exceeded (endpoint: {endpoint})")]
    RateLimited { endpoint: String },

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// A liveness probe did not pass.
    #[error("Health check failed for {endpoint}: {reason}")]
    HealthCheck { endpoint: String, reason: String },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Build a [`TransportError::Timeout`] from the elapsed budget.
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            ms: after.as_millis() as u64,
        }
    }

    /// Returns `true` if this error is retryable (transient).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::WebSocket(_)
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::HealthCheck { .. }
        )
    }

    /// Returns `true` if the endpoint explicitly signalled rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Returns `true` if this is a node-side execution error.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

/// Errors surfaced by the [`ClientPool`](crate::pool::ClientPool) and its
/// retry driver.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool was built from an empty endpoint list.
    #[error("no endpoints configured")]
    NoEndpointsConfigured,

    /// The retry driver ran against a pool that tracks no endpoints.
    #[error("no endpoints available")]
    NoEndpointsAvailable,

    /// Every attempt failed, or every endpoint stayed backed off.
    #[error("all endpoints exhausted after {attempts} attempt(s)")]
    AllEndpointsExhausted {
        attempts: u32,
        #[source]
        source: Option<TransportError>,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl PoolError {
    /// The last endpoint failure wrapped by an exhaustion error, if any.
    pub fn last_failure(&self) -> Option<&TransportError> {
        match self {
            Self::AllEndpointsExhausted { source, .. } => source.as_ref(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
