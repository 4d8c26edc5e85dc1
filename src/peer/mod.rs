//! Peer sessions: one TCP connection, driven from handshake through the
//! `ut_metadata` (BEP 9) exchange to a validated info blob or a typed
//! failure.
use thiserror::Error;

pub mod session;

pub use session::PeerSession;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to connect to peer: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer session timed out")]
    Timeout,

    #[error("peer rejected metadata piece {0} after retry")]
    MetadataReject(u32),

    #[error("info blob SHA-1 does not match the magnet's info hash")]
    HashMismatch,

    #[error("session cancelled")]
    Cancelled,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
