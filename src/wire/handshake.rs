//! The BitTorrent peer handshake: the first 68 bytes exchanged on every
//! peer connection, before any length-prefixed message is sent.
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

use super::{WireError, WireResult};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Reserved-byte bit for the BEP 10 extension protocol (byte 5, bit 0x10).
const EXTENSION_BIT: (usize, u8) = (5, 0x10);
/// Reserved-byte bit for the BEP 6 fast extension (byte 7, bit 0x04).
const FAST_EXTENSION_BIT: (usize, u8) = (7, 0x04);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Builds the handshake this crate sends: BEP 10 extension support
    /// advertised, BEP 6 fast extension advertised.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BIT.0] |= EXTENSION_BIT.1;
        reserved[FAST_EXTENSION_BIT.0] |= FAST_EXTENSION_BIT.1;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BIT.0] & EXTENSION_BIT.1 != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[FAST_EXTENSION_BIT.0] & FAST_EXTENSION_BIT.1 != 0
    }

    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> WireResult<Self> {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;

        if buf[0] != 19 || &buf[1..20] != PROTOCOL.as_slice() {
            return Err(WireError::UnknownProtocol(buf[0..20].to_vec()));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    #[instrument(level = "trace", skip(stream, self))]
    pub async fn write(&self, stream: &mut TcpStream) -> WireResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }
}
