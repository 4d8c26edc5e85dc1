//! Tracker clients: announcing to HTTP and UDP trackers to discover peers
//! for a given info hash.
//!
//! Both transports are driven through the same [`announce`] entry point, so
//! the coordinator never needs to know which scheme a given tracker URL
//! uses.
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::config::FetchConfig;

pub mod http;
pub mod udp;

/// Parameters common to an HTTP or UDP announce request.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes left to download. A metadata-only fetch isn't downloading the
    /// torrent's content at all, so this is always `0`.
    pub left: u64,
    pub numwant: i32,
}

/// The peers and refresh interval a tracker returned.
#[derive(Debug, Clone)]
pub struct AnnounceResult {
    pub peers: Vec<SocketAddr>,
    pub interval: Duration,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unsupported tracker URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid tracker URL: {0}")]
    InvalidUrl(String),

    #[error("network error talking to tracker: {0}")]
    Network(String),

    #[error("tracker request timed out")]
    Timeout,

    #[error("malformed tracker response: {0}")]
    BadResponse(String),

    #[error("tracker returned failure reason: {0}")]
    TrackerFailure(String),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Announces to `tracker_url`, dispatching to the HTTP or UDP transport by
/// URL scheme. `rng` supplies UDP's transaction ids; the HTTP transport
/// ignores it.
#[tracing::instrument(skip(params, config, rng), level = "debug")]
pub async fn announce(
    tracker_url: &str,
    params: &AnnounceParams,
    config: &FetchConfig,
    rng: &crate::rng::SharedRng,
) -> TrackerResult<AnnounceResult> {
    let url = url::Url::parse(tracker_url).map_err(|e| TrackerError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => http::announce(&url, params, config).await,
        "udp" => udp::announce(&url, params, config, rng).await,
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}
