use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, SessionError};
use crate::frame::SocketId;
use crate::timeouts::Timeouts;

enum ConnectState {
    Pending { target: SocketAddr },
    Connected,
}

/// Wraps one TCP socket with lazy connect, per-operation timeouts and
/// cancellation.
///
/// Invariants: `connected == false` implies a target endpoint is present
/// and the socket is not yet connected; only one connect attempt is ever
/// in flight, serialized by `connect_mutex`; any Send/Receive error trips
/// `timeouts`, failing every other outstanding and future operation on
/// this context.
pub struct SocketContext {
    id: SocketId,
    connect_mutex: Mutex<ConnectState>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    timeouts: Timeouts,
}

impl SocketContext {
    /// Wraps an already-connected socket (the listener side's accept path).
    pub fn connected(id: SocketId, stream: TcpStream, timeouts: Timeouts) -> Self {
        let (read, write) = stream.into_split();
        Self {
            id,
            connect_mutex: Mutex::new(ConnectState::Connected),
            read_half: Mutex::new(Some(read)),
            write_half: Mutex::new(Some(write)),
            timeouts,
        }
    }

    /// Creates a context that connects to `target` lazily on first
    /// Send/Receive (the server side's auto-connect path).
    pub fn pending(id: SocketId, target: SocketAddr, timeouts: Timeouts) -> Self {
        Self {
            id,
            connect_mutex: Mutex::new(ConnectState::Pending { target }),
            read_half: Mutex::new(None),
            write_half: Mutex::new(None),
            timeouts,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Connects if not already connected. Serialized by `connect_mutex` so
    /// at most one connect attempt is ever in flight; the mutex is released
    /// before any subsequent I/O, so a send and a receive may then proceed
    /// concurrently. `cancel`, when given, additionally fails the connect
    /// deadline fast (used by the auto-connect `SocketMap::get_socket` to
    /// honor its caller's token).
    pub async fn ensure_connected(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let mut state = self.connect_mutex.lock().await;
        let target = match &*state {
            ConnectState::Connected => return Ok(()),
            ConnectState::Pending { target } => *target,
        };
        let stream = match self
            .timeouts
            .connect_linked(cancel, TcpStream::connect(target))
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                self.timeouts.cancel();
                return Err(err);
            }
        };
        let (read, write) = stream.into_split();
        *self.read_half.lock().await = Some(read);
        *self.write_half.lock().await = Some(write);
        *state = ConnectState::Connected;
        Ok(())
    }

    /// Sends `segment`. A zero-length segment issues an orderly TCP
    /// disconnect (no linger) rather than writing.
    pub async fn send(&self, segment: &[u8]) -> Result<()> {
        self.ensure_connected(None).await?;
        let mut guard = self.write_half.lock().await;
        let write = guard.as_mut().expect("connected by connect_on_demand");
        if segment.is_empty() {
            if let Err(err) = write.shutdown().await {
                warn!(id = ?self.id, %err, "orderly close failed");
                self.timeouts.cancel();
                return Err(SessionError::Io(err));
            }
            return Ok(());
        }
        let result = self
            .timeouts
            .send(async { write.write_all(segment).await })
            .await;
        if let Err(ref err) = result {
            warn!(id = ?self.id, %err, "send failed");
            self.timeouts.cancel();
        }
        result
    }

    /// Reads up to `buffer.len()` bytes, returning the number of bytes read
    /// (0 signals the peer closed its write side — an orderly EOF, not an
    /// error). Guarded by the full idle timeout on every call.
    pub async fn receive(&self, buffer: &mut [u8]) -> Result<usize> {
        self.ensure_connected(None).await?;
        let mut guard = self.read_half.lock().await;
        let read = guard.as_mut().expect("connected by connect_on_demand");
        let result = self.timeouts.receive(async { read.read(buffer).await }).await;
        if let Err(ref err) = result {
            warn!(id = ?self.id, %err, "receive failed");
            self.timeouts.cancel();
        }
        result
    }

    /// Sleeps the configured linger delay, or returns early on cancellation.
    pub async fn linger(&self) {
        self.timeouts.linger().await
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }
}

impl std::fmt::Debug for SocketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketContext").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeouts::TimeoutConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn lazy_connect_then_echo() {
        let addr = echo_server().await;
        let parent = CancellationToken::new();
        let timeouts = Timeouts::new(&parent, TimeoutConfig::default());
        let ctx = SocketContext::pending(SocketId(1), addr, timeouts);

        ctx.send(b"hello").await.unwrap();
        let mut buf = [0u8; 1024];
        let n = ctx.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn connect_failure_trips_cancel() {
        let parent = CancellationToken::new();
        let mut config = TimeoutConfig::default();
        config.connect_timeout = Duration::from_millis(50);
        let timeouts = Timeouts::new(&parent, config);
        // port 0 is never listening once resolved to a concrete unused port
        let unreachable = "127.0.0.1:1".parse().unwrap();
        let ctx = SocketContext::pending(SocketId(2), unreachable, timeouts.clone());
        let result = ctx.send(b"x").await;
        assert!(result.is_err());
        assert!(timeouts.is_cancelled());
    }

    #[tokio::test]
    async fn zero_length_send_is_orderly_close() {
        let addr = echo_server().await;
        let parent = CancellationToken::new();
        let timeouts = Timeouts::new(&parent, TimeoutConfig::default());
        let ctx = SocketContext::pending(SocketId(3), addr, timeouts);
        ctx.send(b"x").await.unwrap();
        ctx.send(&[]).await.unwrap();
    }
}
