//! Serializable health view of a pool.

use serde::Serialize;

use super::record::EndpointRecord;
use crate::endpoint::{Endpoint, Protocol};

/// Pool partition an endpoint is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Active,
    Cooling,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cooling => write!(f, "cooling"),
        }
    }
}

/// Point-in-time health of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub identity: String,
    pub protocol: Protocol,
    pub tier: Tier,
    pub success_rate: f64,
    /// `None` until the endpoint has completed a call.
    pub latency_ewma_ms: Option<f64>,
    pub health_streak: u32,
    pub max_retries: u32,
    pub rate_limit_delay_ms: u64,
}

impl EndpointHealth {
    pub(crate) fn from_record<E: Endpoint + ?Sized>(record: &EndpointRecord<E>, tier: Tier) -> Self {
        Self {
            identity: record.identity().to_string(),
            protocol: record.handle.protocol(),
            tier,
            success_rate: record.success_rate,
            latency_ewma_ms: record.latency_ewma_ms,
            health_streak: record.health_streak,
            max_retries: record.max_retries,
            rate_limit_delay_ms: record.rate_limit_delay.as_millis() as u64,
        }
    }
}

/// Summary returned by [`ClientPool::snapshot`](super::ClientPool::snapshot).
///
/// `endpoints` lists the active tier first, then cooling, each in rank order.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub active_count: usize,
    pub cooling_count: usize,
    /// Endpoint the round-robin cursor points at next.
    pub current: Option<String>,
    pub endpoints: Vec<EndpointHealth>,
}

impl PoolSnapshot {
    pub fn endpoint(&self, identity: &str) -> Option<&EndpointHealth> {
        self.endpoints.iter().find(|e| e.identity == identity)
    }
}
