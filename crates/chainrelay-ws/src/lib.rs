//! chainrelay-ws — reconnecting subscription multiplexer.
//!
//! # Features
//! - One physical stream connection shared by any number of subscriptions
//! - Fixed-interval reconnect, interruptible by [`SubscriptionMultiplexer::close`]
//! - Subscriptions replayed in registration order after every reconnect
//! - Bounded per-subscription mailboxes that never block the read loop
//! - Malformed frames are logged and skipped
//!
//! # Example
//! ```rust,no_run
//! use chainrelay_ws::{MultiplexerConfig, SubscriptionMultiplexer};
//!
//! # async fn run() -> Result<(), chainrelay_core::TransportError> {
//! let mux = SubscriptionMultiplexer::websocket("wss://rpc.example.com/websocket", MultiplexerConfig::default());
//! let (_id, mut blocks) = mux.subscribe_channel("tm.event='NewBlock'").await?;
//! while let Some(event) = blocks.recv().await {
//!     println!("{}", event.payload);
//! }
//! mux.close().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod frame;
pub mod multiplexer;
pub mod subscriptions;

pub use connection::{Connector, FrameSink, FrameSource, WsConnector};
pub use multiplexer::{MultiplexerConfig, MuxState, SubscriptionMultiplexer};
pub use subscriptions::{mailbox, Mailbox, MailboxReceiver, SubscriptionEvent, SubscriptionId};
