//! Per-endpoint health metadata and tier ordering.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::Endpoint;

/// Trust decays by this factor for every extra attempt a caller needed.
const ATTEMPT_DECAY: f64 = 0.8;

/// One pooled endpoint plus everything the pool has learned about it.
pub(crate) struct EndpointRecord<E: ?Sized> {
    pub(crate) handle: Arc<E>,
    /// Smoothed recent-success signal in `[0, 1]`.
    pub(crate) success_rate: f64,
    /// EWMA latency in milliseconds; `None` until the first sample.
    pub(crate) latency_ewma_ms: Option<f64>,
    /// Consecutive passing probes while cooling.
    pub(crate) health_streak: u32,
    pub(crate) rate_limit_delay: Duration,
    pub(crate) max_retries: u32,
}

impl<E: Endpoint + ?Sized> EndpointRecord<E> {
    pub(crate) fn new(handle: Arc<E>) -> Self {
        let max_retries = handle.max_retries();
        Self {
            handle,
            success_rate: 1.0,
            latency_ewma_ms: None,
            health_streak: 0,
            rate_limit_delay: Duration::ZERO,
            max_retries,
        }
    }

    pub(crate) fn identity(&self) -> &str {
        self.handle.identity()
    }

    /// Fold one caller-reported outcome into the record.
    pub(crate) fn apply_outcome(
        &mut self,
        attempts_used: u32,
        latency: Duration,
        success: bool,
        alpha: f64,
    ) {
        if success {
            let extra = attempts_used.max(1) - 1;
            self.success_rate = ATTEMPT_DECAY.powi(extra.min(i32::MAX as u32) as i32);
            self.record_latency(latency.as_secs_f64() * 1_000.0, alpha);
        } else {
            self.success_rate = 0.0;
        }
    }

    fn record_latency(&mut self, sample_ms: f64, alpha: f64) {
        self.latency_ewma_ms = Some(match self.latency_ewma_ms {
            Some(prev) => alpha * sample_ms + (1.0 - alpha) * prev,
            None => sample_ms,
        });
    }
}

/// Unmeasured latency ranks behind every measured one.
fn latency_key(ms: Option<f64>) -> f64 {
    ms.unwrap_or(f64::INFINITY)
}

/// Best first: higher success rate, then lower latency.
pub(crate) fn rank<E: ?Sized>(a: &EndpointRecord<E>, b: &EndpointRecord<E>) -> Ordering {
    b.success_rate
        .total_cmp(&a.success_rate)
        .then_with(|| latency_key(a.latency_ewma_ms).total_cmp(&latency_key(b.latency_ewma_ms)))
}

pub(crate) fn sort_tier<E: ?Sized>(records: &mut [EndpointRecord<E>]) {
    records.sort_by(rank);
}

#[cfg(test)]
pub(crate) fn is_sorted<E: ?Sized>(records: &[EndpointRecord<E>]) -> bool {
    records
        .windows(2)
        .all(|pair| rank(&pair[0], &pair[1]) != Ordering::Greater)
}
