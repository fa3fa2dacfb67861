use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::frame::{self, SocketId, ID_LEN, MAX_FRAME_LEN};
use crate::socket::SocketContext;
use crate::socket_map::SocketMap;
use crate::timeouts::TimeoutConfig;
use crate::transport::Transport;

/// Deadline pump B grants a stale per-socket task to finish before it is
/// left in the table for another round.
const STALE_TASK_GRACE: Duration = Duration::from_millis(1);

/// Bounds `fut` by `duration`, additionally failing fast on `cancel` — used
/// for the Transport-level idle/send timeouts in pump A and `socket_receive`,
/// which operate on `Result<T, SessionError>` futures rather than the
/// raw-io futures `Timeouts::bounded` wraps.
async fn bound_transport_op<F, T>(
    duration: Duration,
    cancel: &CancellationToken,
    on_timeout: SessionError,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = tokio::time::timeout(duration, fut) => match result {
            Ok(inner) => inner,
            Err(_elapsed) => Err(on_timeout),
        },
    }
}

/// Runs the two concurrent pumps of one multiplex session over a Transport
/// and a SocketMap, completing when either pump completes.
pub struct Multiplexer {
    transport: Arc<dyn Transport>,
    socket_map: Arc<dyn SocketMap>,
    cancel: CancellationToken,
    timeout_config: TimeoutConfig,
}

impl Multiplexer {
    pub fn new(
        transport: Arc<dyn Transport>,
        socket_map: Arc<dyn SocketMap>,
        cancel: CancellationToken,
        timeout_config: TimeoutConfig,
    ) -> Self {
        Self {
            transport,
            socket_map,
            cancel,
            timeout_config,
        }
    }

    /// Launches pump A (tunnel -> sockets) and pump B (sockets -> tunnel),
    /// returning as soon as either one completes.
    pub async fn multiplex(self) -> Result<()> {
        let session_id: u64 = rand::random();
        debug!(session_id, "multiplex session starting");
        let result = tokio::select! {
            result = self.pump_tunnel_to_sockets() => result,
            result = self.pump_sockets_to_tunnel() => result,
        };
        match &result {
            Ok(()) => debug!(session_id, "multiplex session ended"),
            Err(err) => warn!(session_id, %err, "multiplex session ended"),
        }
        result
    }

    /// Pump A: receive a Transport message, split it, resolve the target
    /// socket, and forward the payload — a zero-length payload is an
    /// orderly-close signal handled by `SocketContext::send` itself.
    ///
    /// `NoSuchSocket` (a malformed id on the listener side, which has no
    /// auto-connect to fall back to) is session-fatal, matching
    /// `MalformedFrame`. A failed auto-connect (`ConnectFailed`) and a
    /// failure sending to an already-resolved socket are both contained to
    /// the offending id (removed, loop continues) so one unreachable target
    /// doesn't end the tunnel for every other multiplexed connection.
    async fn pump_tunnel_to_sockets(&self) -> Result<()> {
        let mut buf = Vec::with_capacity(MAX_FRAME_LEN);
        loop {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            bound_transport_op(
                self.timeout_config.idle_timeout,
                &self.cancel,
                SessionError::ReceiveTimeout,
                self.transport.receive(&mut buf),
            )
            .await?;
            let (payload, id) = frame::split(&buf)?;
            let payload = payload.to_vec();
            let socket = match self.socket_map.get_socket(id, Some(&self.cancel)).await {
                Ok(socket) => socket,
                Err(SessionError::ConnectFailed(err)) => {
                    warn!(?id, %err, "auto-connect failed, dropping socket");
                    self.socket_map.remove_socket(id);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if let Err(err) = socket.send(&payload).await {
                warn!(?id, %err, "socket send failed, dropping socket");
                self.socket_map.remove_socket(id);
            }
        }
    }

    /// Pump B: keeps one `SocketReceive` task alive per socket currently in
    /// the map, driven by repeated snapshots of the map.
    async fn pump_sockets_to_tunnel(&self) -> Result<()> {
        let mut tasks: HashMap<SocketId, JoinHandle<Result<()>>> = HashMap::new();
        loop {
            let snapshot = self.socket_map.snapshot()?;
            for (id, socket) in snapshot.sockets() {
                if !tasks.contains_key(id) {
                    let handle = tokio::spawn(socket_receive(
                        *id,
                        socket.clone(),
                        self.transport.clone(),
                        self.socket_map.clone(),
                        self.cancel.clone(),
                        self.timeout_config.send_timeout,
                    ));
                    tasks.insert(*id, handle);
                }
            }

            let stale: Vec<SocketId> = tasks
                .keys()
                .filter(|id| !snapshot.sockets().contains_key(id))
                .copied()
                .collect();
            for id in stale {
                if let Some(mut handle) = tasks.remove(&id) {
                    match tokio::time::timeout(STALE_TASK_GRACE, &mut handle).await {
                        Ok(Ok(Err(err))) => return Err(err),
                        Ok(Ok(Ok(()))) => {}
                        Ok(Err(join_err)) => warn!(?id, %join_err, "socket receive task panicked"),
                        Err(_elapsed) => {
                            tasks.insert(id, handle);
                        }
                    }
                }
            }

            let lifetime = snapshot.lifetime().clone();
            drop(snapshot);
            lifetime.wait_while_alive(&self.cancel).await;
            if self.cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
        }
    }
}

/// One per-socket task: reads from `socket`, frames with `id`, and forwards
/// through `transport`, until the socket is exhausted or errors.
///
/// `socket.receive` errors (idle timeout, I/O) are contained: logged, the
/// socket is removed from the map, and the task exits cleanly (`Ok`).
/// `transport.send` errors are session-fatal and propagate as `Err`.
async fn socket_receive(
    id: SocketId,
    socket: Arc<SocketContext>,
    transport: Arc<dyn Transport>,
    socket_map: Arc<dyn SocketMap>,
    cancel: CancellationToken,
    send_timeout: Duration,
) -> Result<()> {
    let mut payload_buf = vec![0u8; MAX_FRAME_LEN - ID_LEN];
    let mut frame_buf = Vec::with_capacity(MAX_FRAME_LEN);
    loop {
        match socket.receive(&mut payload_buf).await {
            Ok(len) => {
                frame::join(&mut frame_buf, &payload_buf[..len], id);
                let sent = bound_transport_op(
                    send_timeout,
                    &cancel,
                    SessionError::SendTimeout,
                    transport.send(&frame_buf),
                )
                .await;
                if let Err(err) = sent {
                    warn!(?id, %err, "transport send failed");
                    socket_map.remove_socket(id);
                    return Err(err);
                }
                if len == 0 {
                    debug!(?id, "peer closed for reading, socket removed");
                    socket_map.remove_socket(id);
                    return Ok(());
                }
            }
            Err(err) => {
                warn!(?id, %err, "socket receive failed, socket removed");
                socket_map.remove_socket(id);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_map::ListenerSocketMap;
    use crate::timeouts::{TimeoutConfig, Timeouts};
    use crate::transport::ChannelTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
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
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn echoes_one_connection_end_to_end() {
        let echo_addr = echo_server().await;
        let (server_transport, client_transport) = ChannelTransport::pair();

        let parent = CancellationToken::new();
        let server_map: Arc<dyn SocketMap> = Arc::new(crate::socket_map::AutoConnectSocketMap::new(
            echo_addr,
            TimeoutConfig::default(),
            parent.clone(),
        ));
        let server_mux = Multiplexer::new(
            Arc::new(server_transport),
            server_map,
            parent.child_token(),
            TimeoutConfig::default(),
        );
        let server_task = tokio::spawn(server_mux.multiplex());

        // drive the "client" side of the tunnel directly: frame a request,
        // push it through the shared channel transport, and read back the
        // framed reply.
        let id = SocketId(7);
        let mut request = Vec::new();
        frame::join(&mut request, b"ping", id);
        client_transport.send(&request).await.unwrap();

        let mut reply = Vec::new();
        client_transport.receive(&mut reply).await.unwrap();
        let (payload, reply_id) = frame::split(&reply).unwrap();
        assert_eq!(payload, b"ping");
        assert_eq!(reply_id, id);

        parent.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }

    #[tokio::test]
    async fn failed_auto_connect_stays_contained_to_one_socket() {
        // nothing listens here; connect_timeout kept short so the test
        // doesn't wait out the default
        let unreachable: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (server_transport, client_transport) = ChannelTransport::pair();

        let mut config = TimeoutConfig::default();
        config.connect_timeout = Duration::from_millis(50);

        let parent = CancellationToken::new();
        let server_map: Arc<dyn SocketMap> = Arc::new(crate::socket_map::AutoConnectSocketMap::new(
            unreachable,
            config,
            parent.clone(),
        ));
        let server_mux = Multiplexer::new(Arc::new(server_transport), server_map, parent.child_token(), config);
        let server_task = tokio::spawn(server_mux.multiplex());

        // conn-1 routes to the unreachable target; auto-connect fails and
        // must be contained to conn-1 rather than ending the whole session.
        let mut request = Vec::new();
        frame::join(&mut request, b"ping", SocketId(1));
        client_transport.send(&request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!server_task.is_finished(), "session ended after conn-1's failed auto-connect");

        // conn-2 on the same tunnel must still get a chance to auto-connect
        // rather than finding the session already torn down.
        let mut request = Vec::new();
        frame::join(&mut request, b"ping", SocketId(2));
        client_transport.send(&request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!server_task.is_finished(), "session ended after conn-2's failed auto-connect");

        parent.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), server_task).await;
    }

    #[tokio::test]
    async fn malformed_frame_ends_session() {
        let (server_transport, client_transport) = ChannelTransport::pair();
        let parent = CancellationToken::new();
        let map: Arc<dyn SocketMap> = Arc::new(ListenerSocketMap::new());
        let mux = Multiplexer::new(
            Arc::new(server_transport),
            map,
            parent.child_token(),
            TimeoutConfig::default(),
        );
        let session = tokio::spawn(mux.multiplex());

        client_transport.send(&[0u8; 4]).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .expect("session should end promptly")
            .unwrap();
        assert!(matches!(result, Err(SessionError::MalformedFrame { .. })));
    }

    #[tokio::test]
    async fn close_frame_removes_listener_socket() {
        let listener_map = Arc::new(ListenerSocketMap::new());
        let addr = echo_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let id = SocketId(11);
        let parent = CancellationToken::new();
        let timeouts = Timeouts::new(&parent, TimeoutConfig::default());
        listener_map
            .add(Arc::new(SocketContext::connected(id, stream, timeouts)))
            .unwrap();

        let (server_transport, client_transport) = ChannelTransport::pair();
        let map: Arc<dyn SocketMap> = listener_map.clone();
        let mux = Multiplexer::new(
            Arc::new(server_transport),
            map,
            parent.child_token(),
            TimeoutConfig::default(),
        );
        let _session = tokio::spawn(mux.multiplex());

        let mut close_frame = Vec::new();
        frame::join(&mut close_frame, &[], id);
        client_transport.send(&close_frame).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener_map.len(), 0);
    }
}
