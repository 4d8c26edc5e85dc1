//! Tunable limits and timeouts for a fetch.
//!
//! A single `FetchConfig` is threaded through the tracker clients, peer
//! sessions and the coordinator so all three agree on deadlines and size
//! caps without reaching for globals.
use std::time::Duration;

/// Tunables for one `FetchCoordinator::fetch` call.
///
/// `Default` gives the values this crate ships with; callers building a CLI
/// or service on top are free to override any of them.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Upper bound on a single tracker announce round-trip.
    pub announce_timeout: Duration,
    /// Upper bound on a single peer session, from TCP connect through the
    /// last metadata piece.
    pub peer_session_timeout: Duration,
    /// How long a peer session may go without receiving any bytes before
    /// it is treated as stalled.
    pub read_idle_timeout: Duration,
    /// Maximum number of distinct peers kept in the pool at once.
    pub peer_pool_size: usize,
    /// Maximum number of tracker announces in flight at once.
    pub announce_concurrency: usize,
    /// Maximum outstanding, unanswered `ut_metadata` requests per peer
    /// session (BEP 9 pipelining depth).
    pub metadata_pipeline_depth: usize,
    /// Hard ceiling on the whole fetch, from the first announce to either
    /// a winning peer or exhaustion.
    pub overall_deadline: Duration,
    /// Generic peer-wire message size cap, guarding against a malicious or
    /// buggy peer claiming an enormous payload length.
    pub max_message_size: usize,
    /// Sanity cap on the `metadata_size` a peer's extended handshake may
    /// claim; anything larger is rejected before any piece is requested.
    pub max_metadata_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            announce_timeout: Duration::from_secs(30),
            peer_session_timeout: Duration::from_secs(60),
            read_idle_timeout: Duration::from_secs(30),
            peer_pool_size: 30,
            announce_concurrency: 20,
            metadata_pipeline_depth: 5,
            overall_deadline: Duration::from_secs(5 * 60),
            max_message_size: 2 * 1024 * 1024,
            max_metadata_size: 100 * 1024 * 1024,
        }
    }
}
