//! The terminal artifact of a fetch, and the `.torrent` composition the
//! caller builds around it.
//!
//! Everything in this module is downstream of the peer session: once a raw
//! info dictionary has been received and its SHA-1 checked against the
//! magnet's info hash, this module turns it into an `InfoBlob` and (for the
//! CLI) the bencoded metainfo dict a caller writes to disk.
use thiserror::Error;

pub mod info_hash;
pub mod output;

/// Validated raw info-dictionary bytes: their SHA-1 equals the magnet's
/// info hash. Immutable once constructed; the only way to build one is
/// [`InfoBlob::verify`], which enforces that invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoBlob {
    bytes: Vec<u8>,
}

impl InfoBlob {
    /// Checks `bytes`'s SHA-1 against `expected_hash` and, on success,
    /// surrenders them as an `InfoBlob`. This is the only constructor: an
    /// `InfoBlob` cannot exist without having passed this check.
    pub fn verify(bytes: Vec<u8>, expected_hash: &crate::magnet::InfoHash) -> Result<Self, TorrentError> {
        if info_hash::sha1(&bytes) != *expected_hash.as_bytes() {
            return Err(TorrentError::HashMismatch);
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The info dict's `name` field, if present and UTF-8, used to fill
    /// the `{name}` outfile-template placeholder.
    pub fn name(&self) -> Option<String> {
        let value = crate::bencode::decoder::decode(&self.bytes).ok()?;
        let dict = value.as_dict().ok()?;
        let name = dict.get(b"name".as_slice())?.as_bytes().ok()?;
        Some(String::from_utf8_lossy(name).into_owned())
    }
}

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("info dictionary bytes do not hash to the magnet's info hash")]
    HashMismatch,

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
