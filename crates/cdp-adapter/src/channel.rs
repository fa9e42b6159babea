//! Duplex text channels the transport runs on top of.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{AdapterError, AdapterErrorKind};

/// An ordered, reliable channel of JSON-encoded frames.
///
/// `recv_text` must be cancel safe: the transport polls it inside `select!`.
#[async_trait]
pub trait MessageChannel: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), AdapterError>;

    /// `None` once the peer has gone away.
    async fn recv_text(&mut self) -> Option<Result<String, AdapterError>>;
}

pub struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketChannel {
    pub async fn connect(url: &str) -> Result<Self, AdapterError> {
        let (stream, _response) = connect_async(url).await.map_err(|err| {
            AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("websocket connect to {url} failed: {err}"))
        })?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    async fn send_text(&mut self, text: String) -> Result<(), AdapterError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))
    }

    async fn recv_text(&mut self) -> Option<Result<String, AdapterError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|err| {
                        AdapterError::new(AdapterErrorKind::CdpIo)
                            .with_hint(format!("non utf-8 binary frame: {err}"))
                    }))
                }
                Ok(Message::Close(frame)) => {
                    debug!(target: "cdp-transport", ?frame, "websocket close frame received");
                    return None;
                }
                Ok(_) => continue,
                Err(err) => {
                    return Some(Err(
                        AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string())
                    ))
                }
            }
        }
    }
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Builds two connected ends; dropping either one closes the other.
pub fn memory_channel() -> (MemoryChannel, MemoryChannel) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel {
            tx: left_tx,
            rx: left_rx,
        },
        MemoryChannel {
            tx: right_tx,
            rx: right_rx,
        },
    )
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send_text(&mut self, text: String) -> Result<(), AdapterError> {
        self.tx.send(text).map_err(|_| AdapterError::closed())
    }

    async fn recv_text(&mut self) -> Option<Result<String, AdapterError>> {
        self.rx.recv().await.map(Ok)
    }
}
