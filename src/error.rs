use crate::frame::SocketId;

/// Typed error taxonomy for the multiplex session.
///
/// Per-socket errors — including a failed auto-connect (`ConnectFailed`) —
/// are contained by the caller (the offending socket is removed from the
/// map); `Transport`, an unresolvable id (`NoSuchSocket`), a malformed
/// frame, and snapshot bookkeeping errors are session-fatal.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect to target failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    #[error("send timed out")]
    SendTimeout,

    #[error("receive timed out")]
    ReceiveTimeout,

    #[error("malformed frame: message shorter than id suffix ({len} < {id_len})")]
    MalformedFrame { len: usize, id_len: usize },

    #[error("no socket registered for id {0:?}")]
    NoSuchSocket(SocketId),

    #[error("socket id {0:?} already present in map")]
    DuplicateSocket(SocketId),

    #[error("a snapshot is already outstanding")]
    ConcurrentSnapshot,

    #[error("transport closed")]
    TransportClosed,

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SessionError>;
