//! Per-endpoint exponential backoff registry.
//!
//! Each endpoint identity gets an independent cool-down that doubles with
//! every failure recorded while the previous cool-down had already run out:
//!
//! ```text
//! delay = min(base * 2^failure_count, max_delay) ± jitter
//! ```
//!
//! While a cool-down is still running, further penalties do not stack; the
//! caller just gets the remaining time back. Failure history survives expiry
//! so consecutive failures keep escalating, and is forgotten either on
//! [`BackoffRegistry::clear`] after a success or once an entry has sat
//! expired for longer than `max_delay`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;

/// Exponent clamp; keeps `2^failure_count` finite.
const MAX_FAILURE_EXPONENT: u32 = 30;

/// Configuration for a [`BackoffRegistry`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Upper bound on any single cool-down.
    #[serde(rename = "max_delay_ms", with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the delay. Values at or above 1/3
    /// can break delay monotonicity between consecutive failures.
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    failure_count: u32,
    active_until: Instant,
}

impl BackoffEntry {
    fn remaining(&self, now: Instant) -> Duration {
        self.active_until.saturating_duration_since(now)
    }
}

/// Thread-safe map of identity → backoff state.
#[derive(Debug, Default)]
pub struct BackoffRegistry {
    config: BackoffConfig,
    entries: Mutex<HashMap<String, BackoffEntry>>,
}

impl BackoffRegistry {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Time left before `id` may be used again; zero when not backed off.
    pub fn remaining(&self, id: &str) -> Duration {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(id).copied() {
            Some(entry) if entry.active_until > now => entry.remaining(now),
            Some(entry) => {
                if self.is_stale(&entry, now) {
                    entries.remove(id);
                }
                Duration::ZERO
            }
            None => Duration::ZERO,
        }
    }

    /// Returns `true` while `id` is serving a cool-down.
    pub fn is_backed_off(&self, id: &str) -> bool {
        !self.remaining(id).is_zero()
    }

    /// Identities currently serving a cool-down.
    pub fn backed_off(&self) -> HashSet<String> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.active_until > now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Record a failure for `id` and return how long it must rest.
    ///
    /// An unexpired cool-down is returned as-is instead of being extended.
    pub fn penalize_and_get_delay(&self, id: &str, base: Duration) -> Duration {
        let now = Instant::now();
        let mut entries = self.lock();

        let failure_count = match entries.get(id) {
            Some(entry) if entry.active_until > now => return entry.remaining(now),
            Some(entry) if !self.is_stale(entry, now) => entry.failure_count,
            _ => 0,
        };

        let delay = self.compute_delay(base, failure_count);
        entries.insert(
            id.to_string(),
            BackoffEntry {
                failure_count: (failure_count + 1).min(MAX_FAILURE_EXPONENT),
                active_until: now + delay,
            },
        );
        tracing::debug!(
            endpoint = id,
            failures = failure_count + 1,
            delay_ms = delay.as_millis() as u64,
            "endpoint backed off"
        );
        delay
    }

    /// Drop the entry for `id` if its cool-down has already run out.
    ///
    /// An entry still serving its penalty is left alone.
    pub fn clear(&self, id: &str) {
        let now = Instant::now();
        let mut entries = self.lock();
        if entries
            .get(id)
            .is_some_and(|entry| entry.active_until <= now)
        {
            entries.remove(id);
        }
    }

    /// Smallest positive remaining cool-down across all entries, or zero if
    /// nothing is pending.
    pub fn shortest_pending(&self) -> Duration {
        let now = Instant::now();
        self.lock()
            .values()
            .map(|entry| entry.remaining(now))
            .filter(|d| !d.is_zero())
            .min()
            .unwrap_or(Duration::ZERO)
    }

    /// Number of tracked entries, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn compute_delay(&self, base: Duration, failure_count: u32) -> Duration {
        let max = self.config.max_delay;
        let exponent = failure_count.min(MAX_FAILURE_EXPONENT) as i32;
        let raw = base.as_secs_f64() * 2f64.powi(exponent);
        if raw >= max.as_secs_f64() {
            return max;
        }

        let fraction = self.config.jitter_fraction;
        let jittered = if fraction > 0.0 {
            let spread = raw * fraction;
            raw + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            raw
        };
        Duration::from_secs_f64(jittered.max(0.0)).min(max)
    }

    fn is_stale(&self, entry: &BackoffEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.active_until) > self.config.max_delay
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BackoffEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max: Duration, jitter: f64) -> BackoffRegistry {
        BackoffRegistry::new(BackoffConfig {
            max_delay: max,
            jitter_fraction: jitter,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_endpoint_has_no_backoff() {
        let reg = BackoffRegistry::default();
        assert_eq!(reg.remaining("https://a.example"), Duration::ZERO);
        assert_eq!(reg.shortest_pending(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_does_not_stack_while_active() {
        let reg = registry(Duration::from_secs(30), 0.0);
        let first = reg.penalize_and_get_delay("a", Duration::from_secs(5));
        assert_eq!(first, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = reg.penalize_and_get_delay("a", Duration::from_secs(5));
        assert_eq!(second, Duration::from_secs(3));
        assert_eq!(reg.remaining("a"), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_escalate_and_cap() {
        let reg = registry(Duration::from_millis(1_000), 0.1);
        let base = Duration::from_millis(100);
        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let delay = reg.penalize_and_get_delay("a", base);
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= Duration::from_millis(1_000));
            previous = delay;
            tokio::time::advance(delay).await;
        }
        assert_eq!(previous, Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_fraction() {
        let reg = registry(Duration::from_secs(60), 0.1);
        for i in 0..50 {
            let id = format!("ep-{i}");
            let delay = reg.penalize_and_get_delay(&id, Duration::from_secs(1));
            assert!(delay >= Duration::from_millis(900), "{delay:?}");
            assert!(delay <= Duration::from_millis(1_100), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn clear_keeps_active_penalty() {
        let reg = registry(Duration::from_secs(30), 0.0);
        reg.penalize_and_get_delay("a", Duration::from_secs(5));
        reg.clear("a");
        assert_eq!(reg.remaining("a"), Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        reg.clear("a");
        assert!(reg.is_empty());

        // Absent entry: no-op.
        reg.clear("a");
        reg.clear("never-seen");
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_history_restarts_at_base() {
        let reg = registry(Duration::from_secs(30), 0.0);
        let base = Duration::from_secs(1);
        reg.penalize_and_get_delay("a", base);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(reg.penalize_and_get_delay("a", base), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(2)).await;
        reg.clear("a");
        assert_eq!(reg.penalize_and_get_delay("a", base), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_forgotten() {
        let reg = registry(Duration::from_secs(10), 0.0);
        reg.penalize_and_get_delay("a", Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(reg.remaining("a"), Duration::ZERO);
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shortest_pending_picks_minimum() {
        let reg = registry(Duration::from_secs(60), 0.0);
        reg.penalize_and_get_delay("a", Duration::from_secs(8));
        reg.penalize_and_get_delay("b", Duration::from_secs(3));
        assert_eq!(reg.shortest_pending(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(reg.shortest_pending(), Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(reg.shortest_pending(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_exponent_is_clamped() {
        let reg = registry(Duration::MAX, 0.0);
        let mut delays = Vec::new();
        for _ in 0..40 {
            let delay = reg.penalize_and_get_delay("a", Duration::from_nanos(1));
            delays.push(delay);
            tokio::time::advance(delay).await;
        }
        assert_eq!(delays[39], delays[38]);
        assert!(delays[39] > Duration::from_secs(1));
        assert!(delays[39] < Duration::from_secs(2));
    }
}
