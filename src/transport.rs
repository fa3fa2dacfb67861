use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, SessionError};
use crate::frame::MAX_FRAME_LEN;

/// Ordered, reliable, message-preserving duplex channel of binary frames.
/// The WebSocket connection is the production implementation;
/// both directions become unusable once either fails.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message. `message.len()` must not exceed `MAX_FRAME_LEN`.
    async fn send(&self, message: &[u8]) -> Result<()>;

    /// Fills `buf` with the next message, replacing its previous contents.
    async fn receive(&self, buf: &mut Vec<u8>) -> Result<()>;
}

/// WebSocket-backed Transport. Reads are only ever driven by pump A so no
/// read-side synchronization is needed; writes arrive concurrently from
/// every per-socket `SocketReceive` task and are serialized by a mutex.
pub struct WebSocketTransport<S> {
    read: Mutex<futures_util::stream::SplitStream<WebSocketStream<S>>>,
    write: Mutex<futures_util::stream::SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> WebSocketTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (write, read) = stream.split();
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
        }
    }
}

#[async_trait::async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &[u8]) -> Result<()> {
        debug_assert!(message.len() <= MAX_FRAME_LEN, "frame exceeds transport maximum");
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(message.to_vec()))
            .await
            .map_err(|_| SessionError::TransportClosed)
    }

    async fn receive(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await {
                Some(Ok(Message::Binary(data))) => {
                    buf.clear();
                    buf.extend_from_slice(&data);
                    return Ok(());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(SessionError::TransportClosed),
                Some(Ok(_)) => continue,
                Some(Err(_)) => return Err(SessionError::TransportClosed),
            }
        }
    }
}

/// In-memory Transport backed by a pair of unbounded channels, used to
/// exercise the Multiplexer end-to-end without a real WebSocket (this
/// workspace's `worker.rs`/`net/session.rs` idiom of wiring concurrent
/// tasks together with `tokio::sync::mpsc`, applied to a test double).
pub struct ChannelTransport {
    sender: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    receiver: Mutex<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Builds a connected pair: messages sent on one end arrive on the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, rx_b) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                sender: tx_a,
                receiver: Mutex::new(rx_b),
            },
            Self {
                sender: tx_b,
                receiver: Mutex::new(rx_a),
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: &[u8]) -> Result<()> {
        debug_assert!(message.len() <= MAX_FRAME_LEN, "frame exceeds transport maximum");
        self.sender
            .send(message.to_vec())
            .map_err(|_| SessionError::TransportClosed)
    }

    async fn receive(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Some(message) => {
                *buf = message;
                Ok(())
            }
            None => Err(SessionError::TransportClosed),
        }
    }
}
