//! The fetch coordinator: the per-magnet orchestrator that fans out to
//! every tracker, schedules peer sessions with bounded parallelism, and
//! returns as soon as one peer delivers a valid info blob.
use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::FetchConfig;
use crate::magnet::{Magnet, PeerAddress};
use crate::peer::{PeerError, PeerSession};
use crate::rng::SharedRng;
use crate::torrent::InfoBlob;
use crate::tracker::{self, AnnounceParams, TrackerError};

#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("no tracker yielded any peers")]
    NoPeers,

    #[error("no peer produced a valid info blob")]
    NoPeerSucceeded,

    #[error("overall fetch deadline expired")]
    DeadlineExpired,
}

/// Fans out announces and peer sessions for one magnet.
///
/// `rng` is threaded in explicitly (rather than reached for globally) so
/// peer-id and UDP transaction-id generation stay deterministic under test.
pub struct FetchCoordinator {
    config: FetchConfig,
    rng: SharedRng,
}

impl FetchCoordinator {
    pub fn new(config: FetchConfig) -> Self {
        Self::new_with_rng(config, SharedRng::from_os())
    }

    /// Builds a coordinator with a caller-supplied RNG, so tests can seed
    /// it and get reproducible peer ids and tracker transaction ids.
    pub fn new_with_rng(config: FetchConfig, rng: SharedRng) -> Self {
        Self { config, rng }
    }

    pub fn with_default_config() -> Self {
        Self::new(FetchConfig::default())
    }

    /// Runs one fetch to completion: announces to every tracker, drives a
    /// bounded peer pool, and returns the first validated info blob or a
    /// `FetchFailure` once every avenue is exhausted or the deadline
    /// expires.
    #[instrument(skip(self, magnet), fields(info_hash = %magnet.info_hash))]
    pub async fn fetch(&self, magnet: &Magnet) -> Result<InfoBlob, FetchFailure> {
        let overall_cancel = CancellationToken::new();
        let peer_id = crate::magnet::PeerId::generate_with_rng(b"-DM0001-", &self.rng);

        let deadline = tokio::time::sleep(self.config.overall_deadline);
        tokio::pin!(deadline);

        tokio::select! {
            result = self.fetch_inner(magnet, peer_id, overall_cancel.clone()) => {
                overall_cancel.cancel();
                result
            }
            _ = &mut deadline => {
                overall_cancel.cancel();
                Err(FetchFailure::DeadlineExpired)
            }
        }
    }

    async fn fetch_inner(
        &self,
        magnet: &Magnet,
        peer_id: crate::magnet::PeerId,
        cancel: CancellationToken,
    ) -> Result<InfoBlob, FetchFailure> {
        let seen_peers: Arc<Mutex<HashSet<PeerAddress>>> = Arc::new(Mutex::new(HashSet::new()));
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<PeerAddress>();

        // Seed the pool with the magnet's own peer hints immediately; they
        // are fed in identically to tracker-derived peers, sharing the same
        // dedup set and pool.
        for hint in &magnet.peer_hints {
            let mut seen = seen_peers.lock().await;
            if seen.insert(*hint) {
                drop(seen);
                let _ = peer_tx.send(*hint);
            }
        }

        let announce_cancel = cancel.clone();
        let announce_task = self.spawn_announces(magnet, peer_id, seen_peers.clone(), peer_tx.clone(), announce_cancel);
        drop(peer_tx);

        let pool_result = self.run_peer_pool(magnet, peer_id, &mut peer_rx, cancel.clone()).await;

        announce_task.abort();
        pool_result
    }

    /// Spawns one task per tracker announcing concurrently (bounded by
    /// `announce_concurrency`), pushing newly-seen peers onto `peer_tx` as
    /// each tracker replies rather than waiting for all of them.
    fn spawn_announces(
        &self,
        magnet: &Magnet,
        peer_id: crate::magnet::PeerId,
        seen_peers: Arc<Mutex<HashSet<PeerAddress>>>,
        peer_tx: mpsc::UnboundedSender<PeerAddress>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let trackers = magnet.trackers.clone();
        let info_hash = *magnet.info_hash.as_bytes();
        let config = self.config.clone();
        let concurrency = self.config.announce_concurrency.max(1);
        let rng = self.rng.clone();

        tokio::spawn(async move {
            let mut joins = JoinSet::new();
            let mut remaining = trackers.into_iter();

            let spawn_one = |joins: &mut JoinSet<()>, tracker_url: String| {
                let info_hash = info_hash;
                let peer_id = *peer_id.as_bytes();
                let config = config.clone();
                let seen_peers = seen_peers.clone();
                let peer_tx = peer_tx.clone();
                let cancel = cancel.clone();
                let rng = rng.clone();
                joins.spawn(async move {
                    let params = AnnounceParams {
                        info_hash,
                        peer_id,
                        port: 6881,
                        uploaded: 0,
                        downloaded: 0,
                        left: 0,
                        numwant: 50,
                    };
                    tokio::select! {
                        result = tracker::announce(&tracker_url, &params, &config, &rng) => {
                            match result {
                                Ok(announce_result) => {
                                    debug!(tracker = %tracker_url, peers = announce_result.peers.len(), "tracker announce succeeded");
                                    let mut seen = seen_peers.lock().await;
                                    for addr in announce_result.peers {
                                        if seen.insert(addr) {
                                            let _ = peer_tx.send(addr);
                                        }
                                    }
                                }
                                Err(e) => record_tracker_error(&tracker_url, e),
                            }
                        }
                        _ = cancel.cancelled() => {}
                    }
                });
            };

            for _ in 0..concurrency {
                if let Some(tracker_url) = remaining.next() {
                    spawn_one(&mut joins, tracker_url);
                } else {
                    break;
                }
            }
            while joins.join_next().await.is_some() {
                if let Some(tracker_url) = remaining.next() {
                    spawn_one(&mut joins, tracker_url);
                }
            }
        })
    }

    /// Drives a bounded pool of peer sessions: at most `peer_pool_size`
    /// running at once, fed from `peer_rx` in arrival order, skipping
    /// duplicates. Returns as soon as one session succeeds; cancels the
    /// rest and returns `FetchFailure::NoPeerSucceeded` if the channel
    /// closes (all announces done) with every spawned session having
    /// failed.
    async fn run_peer_pool(
        &self,
        magnet: &Magnet,
        peer_id: crate::magnet::PeerId,
        peer_rx: &mut mpsc::UnboundedReceiver<PeerAddress>,
        cancel: CancellationToken,
    ) -> Result<InfoBlob, FetchFailure> {
        let mut joins: JoinSet<Result<InfoBlob, PeerError>> = JoinSet::new();
        let pool_size = self.config.peer_pool_size.max(1);
        let mut channel_open = true;
        let mut any_peer_seen = false;

        loop {
            while joins.len() < pool_size && channel_open {
                match peer_rx.try_recv() {
                    Ok(addr) => {
                        any_peer_seen = true;
                        self.spawn_peer_session(magnet, peer_id, addr, cancel.clone(), &mut joins);
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        channel_open = false;
                        break;
                    }
                }
            }

            if joins.is_empty() {
                if !channel_open {
                    return Err(if any_peer_seen { FetchFailure::NoPeerSucceeded } else { FetchFailure::NoPeers });
                }
                // Pool is empty but more peers may still arrive; wait for
                // either the next peer or the channel to close.
                match peer_rx.recv().await {
                    Some(addr) => {
                        any_peer_seen = true;
                        self.spawn_peer_session(magnet, peer_id, addr, cancel.clone(), &mut joins);
                    }
                    None => {
                        channel_open = false;
                        return Err(if any_peer_seen { FetchFailure::NoPeerSucceeded } else { FetchFailure::NoPeers });
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                Some(addr) = peer_rx.recv(), if channel_open && joins.len() < pool_size => {
                    any_peer_seen = true;
                    self.spawn_peer_session(magnet, peer_id, addr, cancel.clone(), &mut joins);
                }
                Some(joined) = joins.join_next() => {
                    match joined {
                        Ok(Ok(blob)) => {
                            cancel.cancel();
                            info!("peer session produced a validated info blob");
                            return Ok(blob);
                        }
                        Ok(Err(e)) => warn!(error = %e, "peer session failed"),
                        Err(e) => warn!(error = %e, "peer session task panicked or was aborted"),
                    }
                }
            }
        }
    }

    fn spawn_peer_session(
        &self,
        magnet: &Magnet,
        peer_id: crate::magnet::PeerId,
        addr: PeerAddress,
        cancel: CancellationToken,
        joins: &mut JoinSet<Result<InfoBlob, PeerError>>,
    ) {
        let info_hash = magnet.info_hash;
        let config = self.config.clone();
        let peer_id_bytes = *peer_id.as_bytes();
        joins.spawn(async move { PeerSession::fetch(addr, info_hash, peer_id_bytes, &config, cancel).await });
    }
}

fn record_tracker_error(tracker_url: &str, error: TrackerError) {
    debug!(tracker = %tracker_url, error = %error, "tracker announce failed, recorded and ignored");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_failure_messages_are_distinct() {
        assert_ne!(FetchFailure::NoPeers.to_string(), FetchFailure::NoPeerSucceeded.to_string());
        assert_ne!(FetchFailure::NoPeers.to_string(), FetchFailure::DeadlineExpired.to_string());
    }
}
