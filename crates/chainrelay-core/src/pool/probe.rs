//! Background health probing of the cooling tier.
//!
//! A cooling endpoint returns to `active` only after `reactivation_streak`
//! consecutive passing probes, and then at `probation_success_rate` rather
//! than full trust. A single failed probe resets the streak.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::record::sort_tier;
use super::ClientPool;
use crate::endpoint::Endpoint;

/// What one probe round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub failed: usize,
    /// Identities moved back to `active` this round.
    pub reactivated: Vec<String>,
}

impl<E: Endpoint + ?Sized> ClientPool<E> {
    /// Run one probe round over every cooling endpoint.
    ///
    /// Health checks run concurrently and outside the tier lock; results are
    /// folded in afterwards, so endpoints demoted mid-round simply wait for
    /// the next one.
    pub async fn probe_cooling(&self) -> ProbeReport {
        let targets: Vec<Arc<E>> = self
            .lock()
            .cooling
            .iter()
            .map(|r| Arc::clone(&r.handle))
            .collect();
        if targets.is_empty() {
            return ProbeReport::default();
        }

        let timeout = self.config.probe_timeout;
        let results: HashMap<String, bool> = join_all(targets.iter().map(|endpoint| async move {
            let passed = match time::timeout(timeout, endpoint.health_check()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::debug!(endpoint = endpoint.identity(), error = %e, "health probe failed");
                    false
                }
                Err(_) => {
                    tracing::debug!(
                        endpoint = endpoint.identity(),
                        timeout_ms = timeout.as_millis() as u64,
                        "health probe timed out"
                    );
                    false
                }
            };
            (endpoint.identity().to_string(), passed)
        }))
        .await
        .into_iter()
        .collect();

        self.apply_probe_results(&results)
    }

    fn apply_probe_results(&self, results: &HashMap<String, bool>) -> ProbeReport {
        let mut guard = self.lock();
        let tiers = &mut *guard;
        let mut report = ProbeReport::default();
        let mut promote = Vec::new();

        for (idx, record) in tiers.cooling.iter_mut().enumerate() {
            let Some(&passed) = results.get(record.identity()) else {
                continue;
            };
            report.probed += 1;
            if passed {
                record.health_streak += 1;
                if record.health_streak >= self.config.reactivation_streak {
                    promote.push(idx);
                }
            } else {
                record.health_streak = 0;
                report.failed += 1;
            }
        }

        // Back-to-front so earlier indices stay valid.
        for idx in promote.into_iter().rev() {
            let mut record = tiers.cooling.remove(idx);
            record.health_streak = 0;
            record.success_rate = self.config.probation_success_rate;
            tracing::info!(
                endpoint = record.identity(),
                success_rate = record.success_rate,
                "endpoint reactivated after probation"
            );
            report.reactivated.push(record.identity().to_string());
            tiers.active.push(record);
        }

        if !report.reactivated.is_empty() {
            sort_tier(&mut tiers.active);
            sort_tier(&mut tiers.cooling);
            tiers.clamp_cursor();
        }
        report
    }

    /// Start the periodic probe loop.
    ///
    /// Long-lived pools should call this right after construction; it is
    /// the only path by which cooling endpoints return to `active`.
    ///
    /// The task holds only a weak reference, so it ends on its own once the
    /// pool is dropped; [`HealthProbeHandle::stop`] ends it earlier.
    pub fn spawn_health_probe(self: &Arc<Self>) -> HealthProbeHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(probe_loop(
            Arc::downgrade(self),
            self.config.probe_interval,
            token.clone(),
        ));
        HealthProbeHandle {
            token,
            task: Some(task),
        }
    }
}

async fn probe_loop<E: Endpoint + ?Sized>(
    pool: Weak<ClientPool<E>>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            report = pool.probe_cooling() => {
                if report.probed > 0 {
                    tracing::debug!(
                        probed = report.probed,
                        failed = report.failed,
                        reactivated = report.reactivated.len(),
                        "probe round complete"
                    );
                }
            }
        }
    }
    tracing::debug!("health probe loop stopped");
}

/// Owner of a running probe loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct HealthProbeHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HealthProbeHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "health probe task ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for HealthProbeHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
