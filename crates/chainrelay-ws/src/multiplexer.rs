//! One long-lived stream connection shared by many logical subscriptions.
//!
//! ```text
//! Connecting ──connect ok, replay──▶ Connected ──read error / EOF──▶ Disconnected
//!     ▲   │                                                             │
//!     │   └─────connect failed───────┐                                  │
//!     └──────wait reconnect_interval─┴──────────────────────────────────┘
//!
//! close() from any state ──▶ Stopped
//! ```
//!
//! A manager task owns the state machine; each established connection gets
//! a reader task that decodes frames and routes events to mailboxes. The
//! write half sits behind an async mutex so live subscribes, replay and
//! teardown are serialized.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use chainrelay_core::TransportError;

use crate::connection::{Connector, FrameSink, FrameSource, WsConnector};
use crate::frame::{self, Frame};
use crate::subscriptions::{mailbox, Dispatch, Mailbox, MailboxReceiver, SubscriptionId, SubscriptionRegistry};

/// Configuration for a [`SubscriptionMultiplexer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Pause after a failed connection attempt and after a lost connection.
    #[serde(rename = "reconnect_interval_ms", with = "chainrelay_core::config::millis")]
    pub reconnect_interval: Duration,
    /// Capacity of mailboxes created by
    /// [`SubscriptionMultiplexer::subscribe_channel`].
    pub mailbox_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            mailbox_capacity: 256,
        }
    }
}

/// Connection state, observable through
/// [`SubscriptionMultiplexer::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxState {
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: MultiplexerConfig,
    registry: SubscriptionRegistry,
    /// `Some` exactly while a connection is established and replayed.
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    state: watch::Sender<MuxState>,
    shutdown: CancellationToken,
}

/// Reconnecting publish/subscribe multiplexer.
///
/// Subscriptions live for the multiplexer's lifetime and are re-issued in
/// registration order after every reconnect, before any new frame is read.
pub struct SubscriptionMultiplexer {
    shared: Arc<Shared>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionMultiplexer {
    /// Start managing connections produced by `connector`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(connector: Arc<dyn Connector>, config: MultiplexerConfig) -> Self {
        let (state, _) = watch::channel(MuxState::Connecting);
        let shared = Arc::new(Shared {
            connector,
            config,
            registry: SubscriptionRegistry::default(),
            sink: tokio::sync::Mutex::new(None),
            state,
            shutdown: CancellationToken::new(),
        });
        let manager = tokio::spawn(run_manager(Arc::clone(&shared)));
        Self {
            shared,
            manager: Mutex::new(Some(manager)),
        }
    }

    /// Start over a WebSocket connection to `url`.
    pub fn websocket(url: impl Into<String>, config: MultiplexerConfig) -> Self {
        Self::start(Arc::new(WsConnector::new(url)), config)
    }

    /// Register `query` with `mailbox` as its delivery target.
    ///
    /// If a connection is up the subscribe request goes out immediately;
    /// otherwise it is sent by the next replay.
    pub async fn subscribe(
        &self,
        mailbox: Mailbox,
        query: impl Into<String>,
    ) -> Result<SubscriptionId, TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TransportError::Other("multiplexer is stopped".into()));
        }

        // Holding the sink lock across the insert orders this call against
        // replay: either the replay snapshot includes the new entry or the
        // live send below sees the replayed connection.
        let mut sink = self.shared.sink.lock().await;
        let sub = self.shared.registry.insert(query.into(), mailbox);
        tracing::debug!(subscription = %sub.id, query = %sub.query, "subscription registered");

        if let Some(sink) = sink.as_mut() {
            let text = frame::subscribe_request(sub.id, &sub.query)?;
            self.shared.registry.expect_ack(sub.id);
            if let Err(e) = sink.send_text(text).await {
                // The reader will see the broken connection; replay covers it.
                tracing::warn!(subscription = %sub.id, error = %e, "live subscribe failed");
            }
        }
        Ok(sub.id)
    }

    /// [`subscribe`](Self::subscribe) with a fresh mailbox of the configured
    /// capacity.
    pub async fn subscribe_channel(
        &self,
        query: impl Into<String>,
    ) -> Result<(SubscriptionId, MailboxReceiver), TransportError> {
        let (tx, rx) = mailbox(self.shared.config.mailbox_capacity);
        let id = self.subscribe(tx, query).await?;
        Ok((id, rx))
    }

    pub fn state(&self) -> MuxState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MuxState> {
        self.shared.state.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn url(&self) -> &str {
        self.shared.connector.url()
    }

    /// Stop both tasks and close the connection. Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        let manager = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(manager) = manager {
            if let Err(e) = manager.await {
                tracing::warn!(error = %e, "multiplexer manager ended abnormally");
            }
        }
    }
}

impl Drop for SubscriptionMultiplexer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("url", &self.url())
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

// ─── Background tasks ─────────────────────────────────────────────────────────

async fn run_manager(shared: Arc<Shared>) {
    loop {
        shared.set_state(MuxState::Connecting);
        let Some(source) = shared.establish().await else {
            break;
        };
        shared.set_state(MuxState::Connected);

        let reader = tokio::spawn(read_loop(Arc::clone(&shared), source));
        if let Err(e) = reader.await {
            tracing::error!(error = %e, "frame reader ended abnormally");
        }

        shared.teardown().await;
        if shared.shutdown.is_cancelled() {
            break;
        }
        shared.set_state(MuxState::Disconnected);
        tracing::warn!(
            url = shared.connector.url(),
            retry_in_ms = shared.config.reconnect_interval.as_millis() as u64,
            "connection lost, reconnecting"
        );
        if !shared.pause().await {
            break;
        }
    }

    shared.teardown().await;
    shared.set_state(MuxState::Stopped);
    tracing::info!(url = shared.connector.url(), "multiplexer stopped");
}

async fn read_loop(shared: Arc<Shared>, mut source: Box<dyn FrameSource>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return,
            next = source.next_frame() => next,
        };
        match next {
            None => {
                tracing::info!(url = shared.connector.url(), "connection closed by peer");
                return;
            }
            Some(Err(e)) => {
                tracing::warn!(url = shared.connector.url(), error = %e, "read failed");
                return;
            }
            Some(Ok(text)) => shared.handle_frame(&text),
        }
    }
}

impl Shared {
    fn set_state(&self, state: MuxState) {
        self.state.send_replace(state);
    }

    /// Connect and replay until it works or shutdown is requested.
    async fn establish(&self) -> Option<Box<dyn FrameSource>> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                attempt = self.connector.connect() => attempt,
            };
            match attempt {
                Ok((sink, source)) => match self.replay(sink).await {
                    Ok(replayed) => {
                        tracing::info!(url = self.connector.url(), replayed, "connected");
                        return Some(source);
                    }
                    Err(e) => tracing::warn!(
                        url = self.connector.url(),
                        error = %e,
                        "subscription replay failed"
                    ),
                },
                Err(e) => tracing::warn!(
                    url = self.connector.url(),
                    error = %e,
                    retry_in_ms = self.config.reconnect_interval.as_millis() as u64,
                    "connect failed"
                ),
            }

            if !self.pause().await {
                return None;
            }
        }
    }

    /// Wait out the reconnect interval. `false` if shutdown came first.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = time::sleep(self.config.reconnect_interval) => true,
        }
    }

    /// Re-issue every registered subscription on a fresh sink, then install
    /// it. The registry is snapshotted under the sink lock so concurrent
    /// subscribes are neither lost nor sent twice.
    async fn replay(&self, mut sink: Box<dyn FrameSink>) -> Result<usize, TransportError> {
        let mut slot = self.sink.lock().await;
        let subs = self.registry.snapshot();
        for sub in &subs {
            let sent = match frame::subscribe_request(sub.id, &sub.query) {
                Ok(text) => {
                    self.registry.expect_ack(sub.id);
                    sink.send_text(text).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                if let Err(close_err) = sink.close().await {
                    tracing::debug!(error = %close_err, "close after failed replay");
                }
                return Err(e);
            }
        }
        *slot = Some(sink);
        Ok(subs.len())
    }

    async fn teardown(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "connection close failed");
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let decoded = match catch_unwind(AssertUnwindSafe(|| frame::decode(text))) {
            Ok(decoded) => decoded,
            Err(_) => {
                tracing::error!(len = text.len(), "panic while decoding frame, skipped");
                return;
            }
        };

        match decoded {
            Ok(Frame::Event {
                subscription_id,
                payload,
            }) => {
                // Only the first response after a subscribe can be its ack.
                let first = self.registry.take_first_response(subscription_id);
                if first && frame::is_ack_payload(&payload) {
                    tracing::debug!(subscription = %subscription_id, "subscribe acknowledged");
                    return;
                }
                match self.registry.dispatch(subscription_id, payload) {
                    Dispatch::Delivered | Dispatch::Dropped => {}
                    Dispatch::UnknownSubscription => {
                        tracing::warn!(subscription = %subscription_id, "event for unknown subscription dropped");
                    }
                }
            }
            Ok(Frame::EnvelopeError {
                subscription_id,
                error,
            }) => {
                tracing::warn!(
                    subscription = ?subscription_id.map(|id| id.0),
                    code = error.code,
                    message = %error.message,
                    "error frame from node"
                );
            }
            Err(e) => {
                let preview: String = text.chars().take(120).collect();
                tracing::warn!(error = %e, frame = %preview, "undecodable frame skipped");
            }
        }
    }
}
