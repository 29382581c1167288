//! Crate-wide error taxonomy.
//!
//! Request correlation, rooms, transfers, and the E2E layer all reject
//! with values from this enum so callers can match on the kind instead
//! of parsing strings. Module-local failure sets that never cross a
//! layer boundary (crypto, storage) keep their own `thiserror` enums
//! and convert into [`Error`] at the seam.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The transport socket failed to open.
    #[error("transport open failed: {0}")]
    OpenFailed(String),

    /// The transport closed underneath an operation.
    #[error("transport closed (code {code}): {reason}")]
    TransportClosed { code: u16, reason: String },

    /// A correlated request, transfer step, or handshake timed out.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// A newer call to the same operation replaced this one.
    #[error("request superseded by a newer call")]
    Superseded,

    /// The caller cancelled the operation.
    #[error("request cancelled")]
    Cancelled,

    /// The client disconnected while the operation was pending.
    #[error("client disconnected")]
    Disconnected,

    /// The server sent an `error` message while the operation was pending.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// A send required an open data channel that was not open.
    #[error("data channel {0:?} is not open")]
    ChannelNotOpen(String),

    /// No peer session exists (or it is not connected) for the target.
    #[error("peer {0} is not connected")]
    PeerNotConnected(String),

    /// Reassembly finished with holes.
    #[error("transfer {id}: missing chunk {index}")]
    MissingChunk { id: String, index: u32 },

    /// An E2E frame failed to decrypt.
    #[error("decrypt failed")]
    Decrypt,

    /// The durable store rejected an operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// The offline pending-op queue is at capacity.
    #[error("pending operations limit reached")]
    QuotaExceeded,

    /// Malformed or unexpected wire data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// WebRTC engine failure surfaced through a session operation.
    #[error("rtc engine error: {0}")]
    Rtc(String),

    /// Construction-time misconfiguration (bad mode, missing merge fn).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for the kinds a caller is expected to retry after reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Disconnected | Error::TransportClosed { .. }
        )
    }
}
