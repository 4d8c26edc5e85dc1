//! SHA-1 hashing of raw info-dictionary bytes.
//!
//! A fetched info blob must be hashed exactly as received over the wire:
//! decoding it into a `BencodeValue` and re-encoding before hashing would
//! only match the original bytes when the remote peer's encoding happens to
//! be canonical. This module hashes the raw bytes directly and never
//! re-encodes them.
use sha1::{Digest, Sha1};

/// Computes the SHA-1 digest of raw bytes.
pub fn sha1(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_empty_input() {
        // Known SHA-1 of the empty string.
        let expected = hex::decode("da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap();
        assert_eq!(sha1(b"").to_vec(), expected);
    }
}
