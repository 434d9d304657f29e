//! The `Endpoint` trait: the capability every pooled backend exposes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Transport family an endpoint speaks. Used as a metrics/snapshot label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// JSON-RPC over HTTP.
    JsonRpcHttp,
    /// JSON-RPC over a WebSocket stream.
    WebSocket,
    /// gRPC query surface.
    Grpc,
    /// REST/LCD query surface.
    Rest,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JsonRpcHttp => write!(f, "jsonrpc-http"),
            Self::WebSocket => write!(f, "websocket"),
            Self::Grpc => write!(f, "grpc"),
            Self::Rest => write!(f, "rest"),
        }
    }
}

/// One backend instance the pool can route operations to.
///
/// The pool never calls into an endpoint's query surface itself: operations
/// are closures handed an `Arc<E>` by the retry driver, so transport-specific
/// methods stay reachable without the pool knowing about them.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be pooled as `Arc<dyn Endpoint>`.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Stable identity (usually the URL). Two handles with the same identity
    /// are the same endpoint as far as the pool is concerned.
    fn identity(&self) -> &str;

    /// Transport family, for labelling.
    fn protocol(&self) -> Protocol;

    /// Lightweight liveness probe. The pool applies its own deadline.
    async fn health_check(&self) -> Result<(), TransportError>;

    /// Per-endpoint retry budget hint surfaced in health snapshots.
    fn max_retries(&self) -> u32 {
        2
    }

    /// Release transport resources. The default does nothing.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
