//! Metrics sink the pool reports into.
//!
//! The core never owns an exporter. Callers inject an `Arc<dyn MetricsSink>`
//! at construction time and bridge it to whatever registry they run.

use crate::endpoint::Protocol;

/// Outcome label attached to attempt and call metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for per-attempt and per-call measurements.
pub trait MetricsSink: Send + Sync + 'static {
    /// One operation invocation against one endpoint.
    fn record_attempt(
        &self,
        protocol: Protocol,
        endpoint: &str,
        operation: &str,
        outcome: Outcome,
        duration_ms: u64,
    );

    /// One `execute_with_retry` call, however many attempts it took.
    fn record_call(&self, protocol: Protocol, operation: &str, outcome: Outcome, attempts: u32);

    /// Emitted once per call that needed more than one attempt.
    fn record_retry(&self, protocol: Protocol, operation: &str);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_attempt(&self, _: Protocol, _: &str, _: &str, _: Outcome, _: u64) {}
    fn record_call(&self, _: Protocol, _: &str, _: Outcome, _: u32) {}
    fn record_retry(&self, _: Protocol, _: &str) {}
}

/// Emits every measurement as a `tracing` event under the
/// `chainrelay::metrics` target, for log-based metric pipelines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_attempt(
        &self,
        protocol: Protocol,
        endpoint: &str,
        operation: &str,
        outcome: Outcome,
        duration_ms: u64,
    ) {
        tracing::debug!(
            target: "chainrelay::metrics",
            metric = "attempt",
            %protocol,
            endpoint,
            operation,
            %outcome,
            duration_ms,
        );
    }

    fn record_call(&self, protocol: Protocol, operation: &str, outcome: Outcome, attempts: u32) {
        tracing::debug!(
            target: "chainrelay::metrics",
            metric = "call",
            %protocol,
            operation,
            %outcome,
            attempts,
        );
    }

    fn record_retry(&self, protocol: Protocol, operation: &str) {
        tracing::debug!(
            target: "chainrelay::metrics",
            metric = "retry",
            %protocol,
            operation,
        );
    }
}
