use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::frame::SocketId;
use crate::multiplexer::Multiplexer;
use crate::socket::SocketContext;
use crate::socket_map::{AutoConnectSocketMap, ListenerSocketMap, SocketMap};
use crate::timeouts::{TimeoutConfig, Timeouts};
use crate::transport::Transport;

/// Listener-side thin Driver: binds a local TCP listener,
/// accepts connections, assigns each a fresh `SocketId`, inserts it into the
/// Listener SocketMap, and runs one Multiplexer over the outbound WebSocket
/// Transport for as long as the process lives.
pub struct ListenerDriver {
    listen_addr: SocketAddr,
    timeout_config: TimeoutConfig,
}

impl ListenerDriver {
    pub fn new(listen_addr: SocketAddr, timeout_config: TimeoutConfig) -> Self {
        Self {
            listen_addr,
            timeout_config,
        }
    }

    /// Runs the accept loop and the Multiplexer concurrently; either one
    /// failing ends the session.
    pub async fn run(&self, transport: Arc<dyn Transport>, cancel: CancellationToken) -> Result<()> {
        let socket_map = Arc::new(ListenerSocketMap::new());

        let accept_loop = self.accept_loop(socket_map.clone(), cancel.clone());
        let socket_map: Arc<dyn SocketMap> = socket_map;
        let multiplex =
            Multiplexer::new(transport, socket_map, cancel.clone(), self.timeout_config).multiplex();

        tokio::select! {
            result = accept_loop => result,
            result = multiplex => result,
        }
    }

    /// Session-scoped `SocketId` assignment: a monotonic counter per
    /// session, seeded from a random offset, is collision-free without a
    /// global atomic shared across unrelated sessions.
    async fn accept_loop(
        &self,
        socket_map: Arc<ListenerSocketMap>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let mut next_id: u64 = rand::random();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let id = SocketId(next_id);
                    next_id = next_id.wrapping_add(1);
                    let timeouts = Timeouts::new(&cancel, self.timeout_config);
                    let ctx = Arc::new(SocketContext::connected(id, stream, timeouts));
                    match socket_map.add(ctx) {
                        Ok(()) => debug!(?id, %peer, "accepted local connection"),
                        Err(err) => warn!(?id, %peer, %err, "failed to register accepted connection"),
                    }
                }
            }
        }
    }
}

/// Server-side thin Driver: given one already-accepted
/// WebSocket Transport, constructs an Auto-connect SocketMap targeting the
/// configured endpoint and runs one Multiplexer for the lifetime of that
/// tunnel session.
pub struct ServerDriver {
    target: SocketAddr,
    timeout_config: TimeoutConfig,
}

impl ServerDriver {
    pub fn new(target: SocketAddr, timeout_config: TimeoutConfig) -> Self {
        Self {
            target,
            timeout_config,
        }
    }

    pub async fn run_session(
        &self,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let socket_map: Arc<dyn SocketMap> = Arc::new(AutoConnectSocketMap::new(
            self.target,
            self.timeout_config,
            cancel.clone(),
        ));
        Multiplexer::new(transport, socket_map, cancel, self.timeout_config)
            .multiplex()
            .await
    }
}
