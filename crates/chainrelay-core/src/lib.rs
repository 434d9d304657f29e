//! chainrelay-core — resilience layer for talking to redundant blockchain nodes.
//!
//! # Overview
//!
//! ChainRelay keeps a client available while individual node endpoints fail,
//! degrade, rate-limit or drop connections. The core crate defines:
//!
//! - [`Endpoint`]: the capability every pooled backend implements
//! - [`ClientPool`]: two-tier, health-ranked, round-robin endpoint pool with
//!   a background probe that reactivates demoted endpoints after probation
//! - [`BackoffRegistry`]: per-endpoint exponential cool-downs
//! - [`ClientPool::execute_with_retry`]: the retry driver applications call
//!   instead of talking to an endpoint directly
//! - [`MetricsSink`]: where per-attempt and per-call measurements go
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: wire types shared by the
//!   transports
//!
//! # Example
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use chainrelay_core::{ClientPool, Endpoint, PoolConfig, TransportError};
//! # async fn run(endpoints: Vec<Arc<dyn Endpoint>>) -> Result<(), Box<dyn std::error::Error>> {
//! let pool = Arc::new(ClientPool::new(endpoints, PoolConfig::default())?);
//! let _probe = pool.spawn_health_probe();
//!
//! let id = pool
//!     .execute("identity", |ep| async move { Ok::<_, TransportError>(ep.identity().to_string()) })
//!     .await?;
//! println!("served by {id}");
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod request;
pub mod retry;

pub use backoff::{BackoffConfig, BackoffRegistry};
pub use config::ClientConfig;
pub use endpoint::{Endpoint, Protocol};
pub use error::{PoolError, TransportError};
pub use metrics::{MetricsSink, NoopMetrics, Outcome, TracingMetrics};
pub use pool::{ClientPool, EndpointHealth, HealthProbeHandle, PoolConfig, PoolSnapshot, ProbeReport, Tier};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use retry::RetryConfig;
pub use tokio_util::sync::CancellationToken;
