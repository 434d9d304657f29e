//! Aggregate client configuration and serde helpers.
//!
//! Every component config has a `Default` carrying production defaults; the
//! aggregate [`ClientConfig`] exists so a whole client can be tuned from one
//! JSON document where only the overridden keys need to appear:
//!
//! ```json
//! { "pool": { "cooling_threshold": 0.4, "probe_interval_ms": 5000 },
//!   "backoff": { "max_delay_ms": 60000 } }
//! ```

use serde::Deserialize;

use crate::backoff::BackoffConfig;
use crate::pool::PoolConfig;
use crate::retry::RetryConfig;

/// Pool, backoff and retry settings in one place.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub backoff: BackoffConfig,
    pub retry: RetryConfig,
}

impl ClientConfig {
    /// Parse a (possibly partial) JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// `Duration` ⇄ integer milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
