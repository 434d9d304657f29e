//! Health-aware retry driver layered on [`ClientPool`].
//!
//! Every attempt goes to a different endpoint where possible:
//!
//! ```text
//! select (skip backed-off) → operation(endpoint) ─ok→ report success, clear backoff, return
//!                                               └err→ report failure, penalize, next attempt
//! ```
//!
//! The attempt budget is the pool size. When every endpoint is backed off
//! the driver sleeps until the shortest cool-down ends instead of burning an
//! attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::endpoint::{Endpoint, Protocol};
use crate::error::{PoolError, TransportError};
use crate::metrics::Outcome;
use crate::pool::ClientPool;

/// Exponential base delays fed into the backoff registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay for the first attempt.
    #[serde(rename = "initial_backoff_ms", with = "crate::config::millis")]
    pub initial_backoff: Duration,
    /// Cap on the base delay.
    #[serde(rename = "max_backoff_ms", with = "crate::config::millis")]
    pub max_backoff: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Base delay for the `attempt`-th attempt (1-based).
    pub fn exponential_base(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap_ms = self.max_backoff.as_millis() as f64;
        Duration::from_millis(base_ms.min(cap_ms) as u64)
    }
}

impl<E: Endpoint + ?Sized> ClientPool<E> {
    /// [`execute_with_retry`](Self::execute_with_retry) without a
    /// cancellation signal.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, PoolError>
    where
        F: FnMut(Arc<E>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.execute_with_retry(operation_name, &CancellationToken::new(), operation)
            .await
    }

    /// Run `operation` against the pool until it succeeds, the attempt
    /// budget (one per endpoint) runs out, or `cancel` fires.
    ///
    /// A cancelled attempt is not scored against the endpoint.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, PoolError>
    where
        F: FnMut(Arc<E>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.len() as u32;
        if max_attempts == 0 {
            return Err(PoolError::NoEndpointsAvailable);
        }

        let mut attempts = 0u32;
        let mut last_error: Option<TransportError> = None;
        let mut protocol = None;

        while attempts < max_attempts {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }

            let endpoint = match self.select_available(|_| false) {
                Some(endpoint) => endpoint,
                None => {
                    let wait = self.backoff().shortest_pending();
                    if wait.is_zero() {
                        break;
                    }
                    tracing::debug!(
                        operation = operation_name,
                        wait_ms = wait.as_millis() as u64,
                        "all endpoints backed off, waiting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                        _ = time::sleep(wait) => {}
                    }
                    continue;
                }
            };

            attempts += 1;
            let id = endpoint.identity();
            protocol = Some(endpoint.protocol());

            let pacing = self.rate_limit_delay(&endpoint);
            if !pacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                    _ = time::sleep(pacing) => {}
                }
            }

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.metrics().record_attempt(
                        endpoint.protocol(),
                        id,
                        operation_name,
                        Outcome::Cancelled,
                        started.elapsed().as_millis() as u64,
                    );
                    return Err(PoolError::Cancelled);
                }
                result = operation(Arc::clone(&endpoint)) => result,
            };
            let elapsed = started.elapsed();
            let elapsed_ms = elapsed.as_millis() as u64;

            match result {
                Ok(value) => {
                    self.report_outcome(&endpoint, attempts, elapsed, true);
                    self.backoff().clear(id);
                    self.metrics().record_attempt(
                        endpoint.protocol(),
                        id,
                        operation_name,
                        Outcome::Success,
                        elapsed_ms,
                    );
                    self.record_call(endpoint.protocol(), operation_name, Outcome::Success, attempts);
                    return Ok(value);
                }
                Err(e) => {
                    self.report_outcome(&endpoint, attempts, elapsed, false);
                    if e.is_rate_limited() {
                        self.apply_rate_limit_penalty(&endpoint);
                    }
                    let delay = self
                        .backoff()
                        .penalize_and_get_delay(id, self.retry_config().exponential_base(attempts));
                    tracing::warn!(
                        operation = operation_name,
                        endpoint = id,
                        attempt = attempts,
                        max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed"
                    );
                    self.metrics().record_attempt(
                        endpoint.protocol(),
                        id,
                        operation_name,
                        Outcome::Failure,
                        elapsed_ms,
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(protocol) = protocol {
            self.record_call(protocol, operation_name, Outcome::Failure, attempts);
        }
        tracing::error!(
            operation = operation_name,
            attempts,
            "all endpoints exhausted"
        );
        Err(PoolError::AllEndpointsExhausted {
            attempts,
            source: last_error,
        })
    }

    fn record_call(
        &self,
        protocol: Protocol,
        operation_name: &str,
        outcome: Outcome,
        attempts: u32,
    ) {
        self.metrics().record_call(protocol, operation_name, outcome, attempts);
        if attempts > 1 {
            self.metrics().record_retry(protocol, operation_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_base_doubles() {
        let cfg = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        };
        assert_eq!(cfg.exponential_base(1), Duration::from_millis(100));
        assert_eq!(cfg.exponential_base(2), Duration::from_millis(200));
        assert_eq!(cfg.exponential_base(3), Duration::from_millis(400));
    }

    #[test]
    fn exponential_base_capped_at_max() {
        let cfg = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 10.0,
        };
        assert_eq!(cfg.exponential_base(5), Duration::from_millis(500));
    }

    #[test]
    fn attempt_zero_treated_as_first() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.exponential_base(0), cfg.exponential_base(1));
    }
}
