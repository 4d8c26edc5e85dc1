//! Library root for demagnetizer.
//!
//! The crate turns a magnet link into validated raw info-dictionary bytes.
//! Re-exports the core modules: bencode, magnet, wire, tracker, peer,
//! coordinator, torrent and config, for use by the `demagnetize` binary and
//! any other caller.
pub mod bencode;
pub mod config;
pub mod coordinator;
pub mod magnet;
pub mod peer;
pub mod rng;
pub mod torrent;
pub mod tracker;
pub mod wire;

pub use config::FetchConfig;
pub use coordinator::{FetchCoordinator, FetchFailure};
pub use rng::SharedRng;
pub use magnet::{InfoHash, Magnet, MagnetParseError, PeerAddress};
pub use torrent::InfoBlob;
