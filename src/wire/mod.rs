//! Peer wire protocol: the handshake, the length-prefixed message codec,
//! and BEP 9/10 extended messages layered on top of it.
//!
//! This module only knows how to encode and decode bytes; it holds no
//! session state and makes no decisions about what to do with a message.
//! That lives in `crate::peer`.
use thiserror::Error;

pub mod extended;
pub mod handshake;
pub mod message;

pub use extended::{ExtendedHandshake, MetadataMessage};
pub use handshake::Handshake;
pub use message::{PeerCodec, PeerMessage};

/// Errors produced while encoding or decoding wire-level data.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol identifier: {0:?}")]
    UnknownProtocol(Vec<u8>),

    #[error("message of length {0} exceeds the configured maximum of {1}")]
    MessageTooLarge(usize, usize),

    #[error("unknown peer message id: {0}")]
    UnknownMessageId(u8),

    #[error("malformed message body: {0}")]
    Malformed(String),

    #[error("bencode error in extended message: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}

pub type WireResult<T> = std::result::Result<T, WireError>;
