//! chainrelay-http — JSON-RPC over HTTP as a poolable [`Endpoint`].
//!
//! [`HttpEndpoint`] is one node; wrap several in a
//! [`ClientPool`](chainrelay_core::ClientPool) to get failover, health
//! ranking and backoff across them.
//!
//! [`Endpoint`]: chainrelay_core::Endpoint

pub mod client;

pub use client::{HttpEndpoint, HttpEndpointConfig};
