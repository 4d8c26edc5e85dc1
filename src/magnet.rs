//! Magnet URI parsing and the core identity/address types shared across the
//! rest of the crate: `InfoHash`, `PeerAddress` and `Magnet` itself.
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

/// 20-byte SHA-1 info hash. Immutable once constructed; comparison is
/// byte-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses a 40-character hex string or 32-character RFC-4648 base-32
    /// string, the two forms a magnet link's `xt=urn:btih:` may carry.
    pub fn parse(s: &str) -> Result<Self, MagnetParseError> {
        match s.len() {
            40 => {
                let mut bytes = [0u8; 20];
                hex::decode_to_slice(s, &mut bytes)
                    .map_err(|_| MagnetParseError::InvalidInfoHash(s.to_string()))?;
                Ok(Self(bytes))
            }
            32 => {
                let bytes = decode_base32(s).ok_or_else(|| MagnetParseError::InvalidInfoHash(s.to_string()))?;
                Ok(Self(bytes))
            }
            _ => Err(MagnetParseError::InvalidInfoHash(s.to_string())),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// RFC-4648 base-32 alphabet, no padding, case-insensitive on decode.
fn decode_base32(s: &str) -> Option<[u8; 20]> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(20);
    for c in s.chars() {
        let c = c.to_ascii_uppercase();
        let idx = ALPHABET.iter().position(|&b| b == c as u8)? as u64;
        bits = (bits << 5) | idx;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(((bits >> bit_count) & 0xFF) as u8);
        }
    }
    out.try_into().ok()
}

/// 20-byte locally-generated peer identifier. No semantic meaning beyond
/// uniqueness at this peer; conventionally starts with a client prefix such
/// as `-XX0000-` followed by random bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a fresh peer id with the given client prefix (e.g.
    /// `-DM0001-`) followed by random bytes filling the remainder, drawn
    /// from `rng` so callers can make the result reproducible in tests.
    pub fn generate_with_rng(prefix: &[u8], rng: &crate::rng::SharedRng) -> Self {
        let mut id = [0u8; 20];
        let n = prefix.len().min(20);
        id[..n].copy_from_slice(&prefix[..n]);
        rng.fill_bytes(&mut id[n..]);
        Self(id)
    }

    /// Generates a fresh peer id from OS entropy. Prefer
    /// [`PeerId::generate_with_rng`] when the caller already holds a
    /// [`crate::rng::SharedRng`].
    pub fn generate(prefix: &[u8]) -> Self {
        Self::generate_with_rng(prefix, &crate::rng::SharedRng::from_os())
    }
}

/// `(ip, port)` pair identifying a reachable peer. Equality is `(ip, port)`
/// only; which tracker produced the address is not part of its identity.
/// `SocketAddr` already has exactly these semantics, so it is reused
/// directly rather than wrapped.
pub type PeerAddress = SocketAddr;

/// A parsed magnet URI.
#[derive(Debug, Clone)]
pub struct Magnet {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    /// `x.pe` peer hints. Accepted and fed into the peer pool the same way
    /// tracker-derived peers are, but never assumed reachable.
    pub peer_hints: Vec<PeerAddress>,
}

impl Magnet {
    pub fn parse(uri: &str) -> Result<Self, MagnetParseError> {
        let url = Url::parse(uri).map_err(|e| MagnetParseError::InvalidUri(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(MagnetParseError::WrongScheme(url.scheme().to_string()));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut peer_hints = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let rest = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| MagnetParseError::UnsupportedUrn(value.to_string()))?;
                    info_hash = Some(InfoHash::parse(rest)?);
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "x.pe" => {
                    if let Ok(addr) = SocketAddr::from_str(value.as_ref()) {
                        peer_hints.push(addr);
                    }
                    // Malformed x.pe hints are dropped silently: they are
                    // hints only, never required for a successful fetch.
                }
                _ => {} // unknown keys are ignored
            }
        }

        Ok(Magnet {
            info_hash: info_hash.ok_or(MagnetParseError::MissingInfoHash)?,
            display_name,
            trackers,
            peer_hints,
        })
    }
}

#[derive(Debug, Error)]
pub enum MagnetParseError {
    #[error("invalid magnet URI: {0}")]
    InvalidUri(String),

    #[error("not a magnet URI (scheme is {0:?})")]
    WrongScheme(String),

    #[error("missing required xt=urn:btih: parameter")]
    MissingInfoHash,

    #[error("unsupported urn in xt parameter: {0}")]
    UnsupportedUrn(String),

    #[error("invalid info hash: {0}")]
    InvalidInfoHash(String),
}
