use crate::error::{Result, SessionError};

/// Maximum Transport message size, including the trailing id suffix.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Width in bytes of the trailing id suffix.
pub const ID_LEN: usize = 8;

/// Opaque 64-bit identifier of one multiplexed TCP socket within a session.
///
/// Equality and hash identity only; encoded little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl SocketId {
    pub fn to_le_bytes(self) -> [u8; ID_LEN] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

/// Splits a Transport message of length `N >= 8` into `(payload, id)`.
///
/// `id` is the trailing `ID_LEN` bytes; `payload` is everything before it.
/// A zero-length payload with a valid id is the orderly-close signal for
/// that id.
pub fn split(message: &[u8]) -> Result<(&[u8], SocketId)> {
    if message.len() < ID_LEN {
        return Err(SessionError::MalformedFrame {
            len: message.len(),
            id_len: ID_LEN,
        });
    }
    let (payload, id_bytes) = message.split_at(message.len() - ID_LEN);
    let mut id = [0u8; ID_LEN];
    id.copy_from_slice(id_bytes);
    Ok((payload, SocketId::from_le_bytes(id)))
}

/// Writes `payload` followed by `id`'s little-endian bytes into `buf`,
/// clearing `buf` first. Returns the combined length.
pub fn join(buf: &mut Vec<u8>, payload: &[u8], id: SocketId) -> usize {
    buf.clear();
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.len()
}
