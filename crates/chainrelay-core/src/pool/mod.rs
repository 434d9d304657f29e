//! Health-scored endpoint pool with two tiers and round-robin selection.
//!
//! Endpoints live in exactly one of two ranked tiers:
//!
//! - **active**: eligible for normal round-robin selection;
//! - **cooling**: demoted after a bad outcome, only handed out when nothing
//!   in `active` qualifies, and promoted back by the background probe after
//!   `reactivation_streak` consecutive passing health checks.
//!
//! Both tiers stay sorted by success rate (descending) and EWMA latency
//! (ascending, unmeasured last).

mod probe;
mod record;
mod snapshot;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::backoff::{BackoffConfig, BackoffRegistry};
use crate::endpoint::Endpoint;
use crate::error::PoolError;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::retry::RetryConfig;

pub use probe::{HealthProbeHandle, ProbeReport};
pub use snapshot::{EndpointHealth, PoolSnapshot, Tier};

use record::{sort_tier, EndpointRecord};

/// Tunables for a [`ClientPool`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Active endpoints whose success rate drops below this are demoted.
    pub cooling_threshold: f64,
    /// Success rate a reactivated endpoint restarts at.
    pub probation_success_rate: f64,
    /// Consecutive passing probes needed to leave the cooling tier.
    pub reactivation_streak: u32,
    /// Interval between probe rounds over the cooling tier.
    #[serde(rename = "probe_interval_ms", with = "crate::config::millis")]
    pub probe_interval: Duration,
    /// Deadline for a single health check.
    #[serde(rename = "probe_timeout_ms", with = "crate::config::millis")]
    pub probe_timeout: Duration,
    /// EWMA smoothing factor for latency samples.
    pub latency_alpha: f64,
    /// Delay added per rate-limit signal.
    #[serde(rename = "rate_limit_step_ms", with = "crate::config::millis")]
    pub rate_limit_step: Duration,
    /// Ceiling for the accumulated rate-limit delay.
    #[serde(rename = "rate_limit_max_ms", with = "crate::config::millis")]
    pub rate_limit_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooling_threshold: 0.5,
            probation_success_rate: 0.8,
            reactivation_streak: 3,
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(4),
            latency_alpha: 0.3,
            rate_limit_step: Duration::from_millis(250),
            rate_limit_max: Duration::from_secs(5),
        }
    }
}

struct Tiers<E: ?Sized> {
    active: Vec<EndpointRecord<E>>,
    cooling: Vec<EndpointRecord<E>>,
    /// Round-robin position into `active`.
    cursor: usize,
}

impl<E: Endpoint + ?Sized> Tiers<E> {
    fn find_mut(&mut self, id: &str) -> Option<&mut EndpointRecord<E>> {
        self.active
            .iter_mut()
            .chain(self.cooling.iter_mut())
            .find(|r| r.identity() == id)
    }

    fn clamp_cursor(&mut self) {
        if self.cursor >= self.active.len() {
            self.cursor = 0;
        }
    }
}

/// Load-balancing pool over a fixed set of endpoints.
///
/// `E` defaults to `dyn Endpoint`; pool a concrete type instead when
/// operations need transport-specific methods.
pub struct ClientPool<E: ?Sized = dyn Endpoint> {
    tiers: Mutex<Tiers<E>>,
    backoff: BackoffRegistry,
    config: PoolConfig,
    retry: RetryConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl<E: Endpoint + ?Sized> ClientPool<E> {
    /// Build a pool from a non-empty list of endpoints.
    ///
    /// Duplicate identities are collapsed onto the first occurrence. The
    /// round-robin cursor starts at a random offset so that many clients
    /// starting together do not all hit the same endpoint first.
    ///
    /// The pool does not start its own health probe. Call
    /// [`spawn_health_probe`](Self::spawn_health_probe) on the `Arc`ed pool
    /// (or drive [`probe_cooling`](Self::probe_cooling) yourself); without
    /// either, demoted endpoints stay in the cooling tier for good and are
    /// only reached through the degraded fallback in
    /// [`select`](Self::select).
    pub fn new(endpoints: Vec<Arc<E>>, config: PoolConfig) -> Result<Self, PoolError> {
        let mut seen = HashSet::new();
        let mut active = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if seen.insert(endpoint.identity().to_string()) {
                active.push(EndpointRecord::new(endpoint));
            } else {
                tracing::warn!(endpoint = endpoint.identity(), "duplicate endpoint ignored");
            }
        }
        if active.is_empty() {
            return Err(PoolError::NoEndpointsConfigured);
        }

        let cursor = rand::thread_rng().gen_range(0..active.len());
        Ok(Self {
            tiers: Mutex::new(Tiers {
                active,
                cooling: Vec::new(),
                cursor,
            }),
            backoff: BackoffRegistry::default(),
            config,
            retry: RetryConfig::default(),
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = BackoffRegistry::new(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn backoff(&self) -> &BackoffRegistry {
        &self.backoff
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    /// Total endpoints across both tiers.
    pub fn len(&self) -> usize {
        let tiers = self.lock();
        tiers.active.len() + tiers.cooling.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn cooling_len(&self) -> usize {
        self.lock().cooling.len()
    }

    /// Which tier `id` currently sits in.
    pub fn tier_of(&self, id: &str) -> Option<Tier> {
        let tiers = self.lock();
        if tiers.active.iter().any(|r| r.identity() == id) {
            Some(Tier::Active)
        } else if tiers.cooling.iter().any(|r| r.identity() == id) {
            Some(Tier::Cooling)
        } else {
            None
        }
    }

    /// Pick the next endpoint not matching `skip`.
    ///
    /// Round-robins over `active`; if every active endpoint is skipped (or
    /// none remain), falls back to the best non-skipped cooling endpoint.
    pub fn select(&self, skip: impl Fn(&E) -> bool) -> Option<Arc<E>> {
        let mut guard = self.lock();
        let tiers = &mut *guard;

        let len = tiers.active.len();
        if len > 0 {
            tiers.clamp_cursor();
            for offset in 0..len {
                let idx = (tiers.cursor + offset) % len;
                if !skip(&*tiers.active[idx].handle) {
                    tiers.cursor = (idx + 1) % len;
                    return Some(Arc::clone(&tiers.active[idx].handle));
                }
            }
        }

        let fallback = tiers
            .cooling
            .iter()
            .find(|r| !skip(&*r.handle))
            .map(|r| Arc::clone(&r.handle));
        if let Some(endpoint) = &fallback {
            tracing::warn!(
                endpoint = endpoint.identity(),
                active = len,
                "no eligible active endpoint, falling back to cooling tier"
            );
        }
        fallback
    }

    /// Like [`select`](Self::select), additionally skipping every endpoint
    /// currently serving a backoff penalty.
    pub fn select_available(&self, skip: impl Fn(&E) -> bool) -> Option<Arc<E>> {
        let backed_off = self.backoff.backed_off();
        self.select(|ep| backed_off.contains(ep.identity()) || skip(ep))
    }

    /// Fold a caller's outcome into `endpoint`'s health and re-rank.
    ///
    /// A failure (or a success that needed enough attempts) pushes an active
    /// endpoint below `cooling_threshold` and demotes it. Cooling endpoints
    /// are only re-sorted here; promotion is the probe loop's job.
    pub fn report_outcome(&self, endpoint: &E, attempts_used: u32, latency: Duration, success: bool) {
        let id = endpoint.identity();
        let alpha = self.config.latency_alpha;
        let mut guard = self.lock();
        let tiers = &mut *guard;

        if let Some(idx) = tiers.active.iter().position(|r| r.identity() == id) {
            let record = &mut tiers.active[idx];
            record.apply_outcome(attempts_used, latency, success, alpha);
            if record.success_rate < self.config.cooling_threshold {
                let mut record = tiers.active.remove(idx);
                record.health_streak = 0;
                tracing::info!(
                    endpoint = id,
                    success_rate = record.success_rate,
                    "endpoint demoted to cooling tier"
                );
                tiers.cooling.push(record);
                sort_tier(&mut tiers.cooling);
                tiers.clamp_cursor();
            }
            sort_tier(&mut tiers.active);
        } else if let Some(idx) = tiers.cooling.iter().position(|r| r.identity() == id) {
            tiers.cooling[idx].apply_outcome(attempts_used, latency, success, alpha);
            sort_tier(&mut tiers.cooling);
        } else {
            tracing::error!(endpoint = id, "outcome reported for an endpoint the pool does not track");
        }
    }

    /// Grow `endpoint`'s pacing delay after an explicit rate-limit response.
    pub fn apply_rate_limit_penalty(&self, endpoint: &E) {
        let id = endpoint.identity();
        let step = self.config.rate_limit_step;
        let max = self.config.rate_limit_max;
        match self.lock().find_mut(id) {
            Some(record) => {
                record.rate_limit_delay = (record.rate_limit_delay + step).min(max);
                tracing::debug!(
                    endpoint = id,
                    delay_ms = record.rate_limit_delay.as_millis() as u64,
                    "rate-limit penalty applied"
                );
            }
            None => {
                tracing::error!(endpoint = id, "rate-limit penalty for an endpoint the pool does not track");
            }
        }
    }

    /// Accumulated rate-limit delay for `endpoint` (zero if unknown).
    pub fn rate_limit_delay(&self, endpoint: &E) -> Duration {
        self.lock()
            .find_mut(endpoint.identity())
            .map(|r| r.rate_limit_delay)
            .unwrap_or(Duration::ZERO)
    }

    /// Read-only health summary, suitable for a status payload.
    pub fn snapshot(&self) -> PoolSnapshot {
        let tiers = self.lock();
        let current = tiers
            .active
            .get(tiers.cursor)
            .map(|r| r.identity().to_string());
        let endpoints = tiers
            .active
            .iter()
            .map(|r| EndpointHealth::from_record(r, Tier::Active))
            .chain(
                tiers
                    .cooling
                    .iter()
                    .map(|r| EndpointHealth::from_record(r, Tier::Cooling)),
            )
            .collect();
        PoolSnapshot {
            active_count: tiers.active.len(),
            cooling_count: tiers.cooling.len(),
            current,
            endpoints,
        }
    }

    /// Close every pooled endpoint, logging failures.
    pub async fn close(&self) {
        let handles: Vec<Arc<E>> = {
            let tiers = self.lock();
            tiers
                .active
                .iter()
                .chain(tiers.cooling.iter())
                .map(|r| Arc::clone(&r.handle))
                .collect()
        };
        for endpoint in handles {
            if let Err(e) = endpoint.close().await {
                tracing::warn!(endpoint = endpoint.identity(), error = %e, "endpoint close failed");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tiers<E>> {
        self.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let tiers = self.lock();
        let mut seen = HashSet::new();
        for r in tiers.active.iter().chain(tiers.cooling.iter()) {
            assert!(seen.insert(r.identity().to_string()), "{} in both tiers", r.identity());
        }
        assert!(record::is_sorted(&tiers.active), "active tier unsorted");
        assert!(record::is_sorted(&tiers.cooling), "cooling tier unsorted");
        assert!(tiers.active.is_empty() || tiers.cursor < tiers.active.len());
    }
}

impl<E: Endpoint + ?Sized> std::fmt::Debug for ClientPool<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers = self.lock();
        f.debug_struct("ClientPool")
            .field("active", &tiers.active.len())
            .field("cooling", &tiers.cooling.len())
            .field("cursor", &tiers.cursor)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::endpoint::Protocol;
    use crate::error::TransportError;

    pub(crate) struct MockEndpoint {
        url: String,
        healthy: AtomicBool,
    }

    impl MockEndpoint {
        pub(crate) fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Endpoint for MockEndpoint {
        fn identity(&self) -> &str {
            &self.url
        }

        fn protocol(&self) -> Protocol {
            Protocol::JsonRpcHttp
        }

        async fn health_check(&self) -> Result<(), TransportError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::HealthCheck {
                    endpoint: self.url.clone(),
                    reason: "mock unhealthy".into(),
                })
            }
        }
    }

    pub(crate) fn mock(url: &str) -> Arc<MockEndpoint> {
        Arc::new(MockEndpoint {
            url: url.to_string(),
            healthy: AtomicBool::new(true),
        })
    }

    pub(crate) fn pool_of(urls: &[&str]) -> (ClientPool<MockEndpoint>, Vec<Arc<MockEndpoint>>) {
        let eps: Vec<_> = urls.iter().map(|u| mock(u)).collect();
        let pool = ClientPool::new(eps.clone(), PoolConfig::default()).unwrap();
        (pool, eps)
    }

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn empty_pool_is_rejected() {
        let err = ClientPool::<MockEndpoint>::new(vec![], PoolConfig::default()).unwrap_err();
        assert!(matches!(err, PoolError::NoEndpointsConfigured));
    }

    #[test]
    fn duplicate_identities_collapse() {
        let a = mock("https://a.example");
        let pool = ClientPool::new(vec![a.clone(), a, mock("https://b.example")], PoolConfig::default())
            .unwrap();
        assert_eq!(pool.len(), 2);
        pool.assert_invariants();
    }

    #[test]
    fn trait_objects_can_be_pooled() {
        let eps: Vec<Arc<dyn Endpoint>> = vec![mock("https://a.example"), mock("https://b.example")];
        let pool: ClientPool = ClientPool::new(eps, PoolConfig::default()).unwrap();
        assert!(pool.select(|_| false).is_some());
    }

    #[test]
    fn round_robin_visits_every_endpoint_once() {
        let urls = ["https://a.example", "https://b.example", "https://c.example", "https://d.example"];
        let (pool, _) = pool_of(&urls);
        let picked: HashSet<String> = (0..urls.len())
            .map(|_| pool.select(|_| false).unwrap().identity().to_string())
            .collect();
        assert_eq!(picked.len(), urls.len());
    }

    #[test]
    fn skip_predicate_is_honoured() {
        let (pool, _) = pool_of(&["https://a.example", "https://b.example"]);
        for _ in 0..5 {
            let ep = pool.select(|ep| ep.identity() == "https://a.example").unwrap();
            assert_eq!(ep.identity(), "https://b.example");
        }
        assert!(pool.select(|_| true).is_none());
    }

    #[test]
    fn failure_demotes_to_cooling() {
        let (pool, eps) = pool_of(&["https://a.example", "https://b.example"]);
        pool.report_outcome(&eps[0], 1, 20 * MS, false);
        assert_eq!(pool.tier_of("https://a.example"), Some(Tier::Cooling));
        assert_eq!(pool.active_len(), 1);
        assert_eq!(pool.cooling_len(), 1);
        pool.assert_invariants();

        // Cooling members never auto-promote from a report.
        pool.report_outcome(&eps[0], 1, 20 * MS, true);
        assert_eq!(pool.tier_of("https://a.example"), Some(Tier::Cooling));
        pool.assert_invariants();
    }

    #[test]
    fn success_rate_decays_with_attempts() {
        let (pool, eps) = pool_of(&["https://a.example", "https://b.example"]);
        pool.report_outcome(&eps[0], 3, 10 * MS, true);
        let health = pool.snapshot().endpoint("https://a.example").cloned().unwrap();
        assert!((health.success_rate - 0.64).abs() < 1e-9);
        assert_eq!(health.tier, Tier::Active);

        // 0.8^4 ≈ 0.41 falls under the 0.5 threshold.
        pool.report_outcome(&eps[0], 5, 10 * MS, true);
        assert_eq!(pool.tier_of("https://a.example"), Some(Tier::Cooling));
    }

    #[test]
    fn latency_ewma_smooths_samples() {
        let (pool, eps) = pool_of(&["https://a.example"]);
        pool.report_outcome(&eps[0], 1, 100 * MS, true);
        pool.report_outcome(&eps[0], 1, 200 * MS, true);
        let health = pool.snapshot().endpoint("https://a.example").cloned().unwrap();
        assert!((health.latency_ewma_ms.unwrap() - 130.0).abs() < 1e-6);
    }

    #[test]
    fn zero_latency_sample_counts_as_measured() {
        let (pool, eps) = pool_of(&["https://a.example", "https://b.example"]);
        pool.report_outcome(&eps[1], 1, 40 * MS, true);
        pool.report_outcome(&eps[0], 1, Duration::ZERO, true);
        pool.assert_invariants();

        let snap = pool.snapshot();
        assert_eq!(snap.endpoint("https://a.example").unwrap().latency_ewma_ms, Some(0.0));
        assert_eq!(snap.endpoints[0].identity, "https://a.example");

        // The next sample is smoothed in, not taken verbatim.
        pool.report_outcome(&eps[0], 1, 100 * MS, true);
        let health = pool.snapshot().endpoint("https://a.example").cloned().unwrap();
        assert!((health.latency_ewma_ms.unwrap() - 30.0).abs() < 1e-6);
    }

    #[test]
    fn unmeasured_latency_reported_as_none() {
        let (pool, _) = pool_of(&["https://a.example"]);
        let health = pool.snapshot().endpoint("https://a.example").cloned().unwrap();
        assert_eq!(health.latency_ewma_ms, None);
    }

    #[test]
    fn tiers_sorted_by_rate_then_latency_unknown_last() {
        let (pool, eps) = pool_of(&["https://a.example", "https://b.example", "https://c.example"]);
        pool.report_outcome(&eps[0], 1, 300 * MS, true);
        pool.report_outcome(&eps[1], 1, 50 * MS, true);
        pool.assert_invariants();

        let order: Vec<String> = pool
            .snapshot()
            .endpoints
            .iter()
            .map(|e| e.identity.clone())
            .collect();
        assert_eq!(order, ["https://b.example", "https://a.example", "https://c.example"]);
    }

    #[test]
    fn unknown_endpoint_report_is_ignored() {
        let (pool, _) = pool_of(&["https://a.example"]);
        let stranger = mock("https://stranger.example");
        pool.report_outcome(&stranger, 1, MS, false);
        pool.apply_rate_limit_penalty(&stranger);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.active_len(), 1);
    }

    #[test]
    fn cooling_fallback_when_active_exhausted() {
        let (pool, eps) = pool_of(&["https://a.example", "https://b.example"]);
        pool.report_outcome(&eps[0], 1, MS, false);
        let ep = pool.select(|ep| ep.identity() == "https://b.example").unwrap();
        assert_eq!(ep.identity(), "https://a.example");

        pool.report_outcome(&eps[1], 1, MS, false);
        assert_eq!(pool.active_len(), 0);
        assert!(pool.select(|_| false).is_some());
        pool.assert_invariants();
    }

    #[test]
    fn cursor_stays_valid_after_demotions() {
        let urls = ["https://a.example", "https://b.example", "https://c.example"];
        let (pool, eps) = pool_of(&urls);
        for _ in 0..2 {
            pool.select(|_| false);
        }
        pool.report_outcome(&eps[2], 1, MS, false);
        pool.report_outcome(&eps[1], 1, MS, false);
        pool.assert_invariants();
        assert_eq!(pool.select(|_| false).unwrap().identity(), "https://a.example");
    }

    #[test]
    fn rate_limit_penalty_accumulates_and_caps() {
        let (pool, eps) = pool_of(&["https://a.example"]);
        for _ in 0..100 {
            pool.apply_rate_limit_penalty(&eps[0]);
        }
        assert_eq!(pool.rate_limit_delay(&eps[0]), pool.config().rate_limit_max);
        assert_eq!(pool.tier_of("https://a.example"), Some(Tier::Active));
    }

    #[test]
    fn snapshot_reports_counts_and_current() {
        let (pool, eps) = pool_of(&["https://a.example", "https://b.example"]);
        pool.report_outcome(&eps[1], 1, MS, false);
        let snap = pool.snapshot();
        assert_eq!(snap.active_count, 1);
        assert_eq!(snap.cooling_count, 1);
        assert_eq!(snap.current.as_deref(), Some("https://a.example"));
        assert_eq!(snap.endpoints.len(), 2);
        assert_eq!(snap.endpoint("https://a.example").unwrap().max_retries, 2);
    }
}
