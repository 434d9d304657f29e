//! The physical stream connection, split into a write half and a read half.
//!
//! The multiplexer only ever sees these traits; [`WsConnector`] is the
//! production implementation over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chainrelay_core::TransportError;

/// Write half of an open connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a close frame and release the write half.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of an open connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame. `None` means the peer closed the connection.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// Opens connections on behalf of the multiplexer.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;

    /// Where connections go, for logging.
    fn url(&self) -> &str;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let (stream, _) = connect_async(self.url.as_str()).await.map_err(ws_error)?;
        let (write, read) = stream.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }

    fn url(&self) -> &str {
        &self.url
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.write.send(Message::Text(text)).await.map_err(ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.write.close().await.map_err(ws_error)
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.read.next().await? {
                Err(e) => return Some(Err(ws_error(e))),
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "WebSocket closed by server");
                    return None;
                }
                Ok(Message::Binary(bytes)) => {
                    tracing::debug!(len = bytes.len(), "binary frame ignored");
                }
                // Pongs for server pings are queued by tungstenite and
                // flushed on the next read.
                Ok(_) => {}
            }
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::WebSocket(e.to_string())
}
