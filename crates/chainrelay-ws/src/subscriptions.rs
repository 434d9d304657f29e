//! Subscription registry and per-subscription mailboxes.
//!
//! The registry is append-only for the multiplexer's lifetime and is
//! replayed in insertion order on every reconnect.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Multiplexer-local subscription id. Monotonic from 1, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivered event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionEvent {
    pub subscription_id: SubscriptionId,
    pub query: String,
    pub payload: Value,
}

/// Create a bounded mailbox pair.
pub fn mailbox(capacity: usize) -> (Mailbox, MailboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Mailbox { tx }, MailboxReceiver { rx })
}

/// Producer side of a subscription's delivery queue.
///
/// Delivery never waits: when the queue is full the event is dropped.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<SubscriptionEvent>,
}

impl Mailbox {
    /// Try to enqueue `event`; returns whether it was accepted.
    pub fn deliver(&self, event: SubscriptionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    subscription = %event.subscription_id,
                    query = %event.query,
                    "mailbox full, event dropped"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(
                    subscription = %event.subscription_id,
                    "mailbox receiver gone, event dropped"
                );
                false
            }
        }
    }

    /// `true` once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a mailbox.
#[derive(Debug)]
pub struct MailboxReceiver {
    rx: mpsc::Receiver<SubscriptionEvent>,
}

impl MailboxReceiver {
    /// Wait for the next event. `None` once the multiplexer is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }

    /// Next queued event, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) query: String,
    mailbox: Mailbox,
}

/// What happened to an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Delivered,
    Dropped,
    UnknownSubscription,
}

#[derive(Debug, Default)]
struct RegistryInner {
    last_id: u64,
    entries: Vec<Subscription>,
    /// Subscribes sent on the current connection with no response yet.
    awaiting_first_response: HashSet<SubscriptionId>,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Allocate the next id and append a subscription.
    pub(crate) fn insert(&self, query: String, mailbox: Mailbox) -> Subscription {
        let mut inner = self.lock();
        inner.last_id += 1;
        let sub = Subscription {
            id: SubscriptionId(inner.last_id),
            query,
            mailbox,
        };
        inner.entries.push(sub.clone());
        sub
    }

    /// Every subscription in insertion order.
    pub(crate) fn snapshot(&self) -> Vec<Subscription> {
        self.lock().entries.clone()
    }

    /// Note that a subscribe request for `id` is about to go out.
    pub(crate) fn expect_ack(&self, id: SubscriptionId) {
        self.lock().awaiting_first_response.insert(id);
    }

    /// `true` if this is the first response for `id` since its subscribe
    /// was sent. Clears the mark either way.
    pub(crate) fn take_first_response(&self, id: SubscriptionId) -> bool {
        self.lock().awaiting_first_response.remove(&id)
    }

    pub(crate) fn dispatch(&self, id: SubscriptionId, payload: Value) -> Dispatch {
        let target = {
            let inner = self.lock();
            // Ids are allocated in increasing order, so entries stay sorted.
            inner
                .entries
                .binary_search_by_key(&id, |s| s.id)
                .ok()
                .map(|idx| inner.entries[idx].clone())
        };
        let Some(sub) = target else {
            return Dispatch::UnknownSubscription;
        };
        let event = SubscriptionEvent {
            subscription_id: sub.id,
            query: sub.query,
            payload,
        };
        if sub.mailbox.deliver(event) {
            Dispatch::Delivered
        } else {
            Dispatch::Dropped
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
