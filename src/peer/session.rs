//! One peer session: handshake, extended handshake, `ut_metadata` piece
//! exchange, hash validation.
//!
//! States: `Connecting -> Handshaking -> ExtHandshaking -> FetchingMetadata
//! -> Done|Failed`. Modelled here as a straight-line async function rather
//! than an explicit state machine type, since every state is visited
//! exactly once per session and there is no external driver re-entering
//! the machine between states. The `tracing` spans at each stage give the
//! same observability an enum would.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{PeerError, PeerResult};
use crate::config::FetchConfig;
use crate::magnet::InfoHash;
use crate::torrent::InfoBlob;
use crate::wire::extended::{ExtendedHandshake, MetadataMessage};
use crate::wire::handshake::Handshake;
use crate::wire::message::{PeerCodec, PeerMessage};

const METADATA_PIECE_SIZE: u32 = 16 * 1024;
/// Our locally-chosen id for the `ut_metadata` extension; the peer's own id
/// for it is whatever it advertises in its extended handshake.
const OUR_UT_METADATA_ID: u8 = 3;

pub struct PeerSession;

impl PeerSession {
    /// Runs one peer session against `addr` to completion, bounded by
    /// `config.peer_session_timeout` and cancellable via `cancel`.
    #[instrument(skip(config, cancel), fields(%addr))]
    pub async fn fetch(
        addr: SocketAddr,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        config: &FetchConfig,
        cancel: CancellationToken,
    ) -> PeerResult<InfoBlob> {
        tokio::select! {
            result = timeout(config.peer_session_timeout, run(addr, info_hash, peer_id, config, &cancel)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(PeerError::Timeout),
                }
            }
            _ = cancel.cancelled() => Err(PeerError::Cancelled),
        }
    }
}

async fn run(
    addr: SocketAddr,
    info_hash: InfoHash,
    peer_id: [u8; 20],
    config: &FetchConfig,
    cancel: &CancellationToken,
) -> PeerResult<InfoBlob> {
    debug!("connecting");
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::Connect(e.to_string()))?;

    let ours = Handshake::new(*info_hash.as_bytes(), peer_id);
    ours.write(&mut stream)
        .await
        .map_err(|e| PeerError::Handshake(e.to_string()))?;
    let theirs = read_with_idle_timeout(Handshake::read(&mut stream), config, cancel)
        .await?
        .map_err(|e| PeerError::Handshake(e.to_string()))?;

    if theirs.info_hash != *info_hash.as_bytes() {
        return Err(PeerError::Handshake("info hash mismatch in peer handshake".into()));
    }
    if !theirs.supports_extensions() {
        return Err(PeerError::Handshake("peer does not support the extension protocol".into()));
    }

    let mut framed = Framed::new(stream, PeerCodec::new(config.max_message_size));

    let our_ext = ExtendedHandshake::ours(OUR_UT_METADATA_ID);
    send_extended(&mut framed, 0, &our_ext.to_bytes().map_err(|e| PeerError::Protocol(e.to_string()))?).await?;

    let peer_ut_metadata_id;
    let metadata_size;
    loop {
        let message = read_with_idle_timeout(next_message(&mut framed), config, cancel).await??;
        match message {
            PeerMessage::Extended { extended_id: 0, payload } => {
                let handshake = ExtendedHandshake::from_bytes(&payload).map_err(|e| PeerError::Protocol(e.to_string()))?;
                peer_ut_metadata_id = handshake
                    .ut_metadata_id()
                    .ok_or_else(|| PeerError::Protocol("peer's extended handshake has no ut_metadata entry".into()))?;
                let size = handshake
                    .metadata_size
                    .ok_or_else(|| PeerError::Protocol("peer's extended handshake has no metadata_size".into()))?;
                if size == 0 || size > config.max_metadata_size as u64 {
                    return Err(PeerError::Protocol(format!("implausible metadata_size {size}")));
                }
                metadata_size = size as u32;
                break;
            }
            other if is_ignorable(&other) => continue,
            other => return Err(PeerError::Protocol(format!("unexpected message before extended handshake: {other:?}"))),
        }
    }

    let num_pieces = metadata_size.div_ceil(METADATA_PIECE_SIZE);
    debug!(metadata_size, num_pieces, "fetching metadata");

    let mut pieces: HashMap<u32, Vec<u8>> = HashMap::with_capacity(num_pieces as usize);
    let mut retried: HashMap<u32, bool> = HashMap::new();
    let mut next_to_request = 0u32;
    let mut outstanding = 0usize;

    while (next_to_request < num_pieces) && outstanding < config.metadata_pipeline_depth {
        let body = request_body(next_to_request).map_err(|e| PeerError::Protocol(e.to_string()))?;
        send_extended(&mut framed, peer_ut_metadata_id, &body).await?;
        next_to_request += 1;
        outstanding += 1;
    }

    while pieces.len() < num_pieces as usize {
        let message = read_with_idle_timeout(next_message(&mut framed), config, cancel).await??;
        match message {
            PeerMessage::Extended { extended_id, payload } if extended_id == OUR_UT_METADATA_ID => {
                let msg = MetadataMessage::from_bytes(&payload).map_err(|e| PeerError::Protocol(e.to_string()))?;
                match msg {
                    MetadataMessage::Data { piece, total_size, block } => {
                        if total_size != metadata_size {
                            return Err(PeerError::Protocol(format!(
                                "piece {piece} total_size {total_size} disagrees with metadata_size {metadata_size}"
                            )));
                        }
                        let expected_len = expected_piece_len(piece, num_pieces, metadata_size);
                        if block.len() as u32 != expected_len {
                            return Err(PeerError::Protocol(format!(
                                "piece {piece} is {} bytes, expected {expected_len}",
                                block.len()
                            )));
                        }
                        outstanding = outstanding.saturating_sub(1);
                        pieces.insert(piece, block);

                        if next_to_request < num_pieces {
                            let body = request_body(next_to_request).map_err(|e| PeerError::Protocol(e.to_string()))?;
                            send_extended(&mut framed, peer_ut_metadata_id, &body).await?;
                            next_to_request += 1;
                            outstanding += 1;
                        }
                    }
                    MetadataMessage::Reject { piece } => {
                        outstanding = outstanding.saturating_sub(1);
                        if *retried.get(&piece).unwrap_or(&false) {
                            return Err(PeerError::MetadataReject(piece));
                        }
                        retried.insert(piece, true);
                        warn!(piece, "peer rejected metadata piece, retrying once");
                        let body = request_body(piece).map_err(|e| PeerError::Protocol(e.to_string()))?;
                        send_extended(&mut framed, peer_ut_metadata_id, &body).await?;
                        outstanding += 1;
                    }
                    MetadataMessage::Request { .. } => {
                        // We never serve metadata; a peer asking us for a
                        // piece is simply ignored.
                    }
                }
            }
            other if is_ignorable(&other) => continue,
            other => return Err(PeerError::Protocol(format!("unexpected message during metadata fetch: {other:?}"))),
        }
    }

    let mut blob = Vec::with_capacity(metadata_size as usize);
    for i in 0..num_pieces {
        let piece = pieces.remove(&i).expect("all pieces present by loop invariant");
        blob.extend_from_slice(&piece);
    }

    InfoBlob::verify(blob, &info_hash).map_err(|_| PeerError::HashMismatch)
}

fn request_body(piece: u32) -> crate::wire::WireResult<Vec<u8>> {
    MetadataMessage::Request { piece }.to_bytes()
}

fn expected_piece_len(piece: u32, num_pieces: u32, metadata_size: u32) -> u32 {
    if piece + 1 < num_pieces {
        METADATA_PIECE_SIZE
    } else {
        let remainder = metadata_size % METADATA_PIECE_SIZE;
        if remainder == 0 { METADATA_PIECE_SIZE } else { remainder }
    }
}

/// Messages that never terminate a session and carry no information this
/// crate acts on: keep-alives, choke state, bitfields/haves and the BEP 6
/// fast-extension messages.
fn is_ignorable(message: &PeerMessage) -> bool {
    matches!(
        message,
        PeerMessage::KeepAlive
            | PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::Have { .. }
            | PeerMessage::Bitfield(_)
            | PeerMessage::HaveAll
            | PeerMessage::HaveNone
            | PeerMessage::Reject { .. }
            | PeerMessage::AllowedFast { .. }
            | PeerMessage::Suggest { .. }
    )
}

async fn send_extended(framed: &mut Framed<TcpStream, PeerCodec>, extended_id: u8, payload: &[u8]) -> PeerResult<()> {
    framed
        .send(PeerMessage::Extended { extended_id, payload: payload.to_vec() })
        .await
        .map_err(|e| PeerError::Protocol(e.to_string()))
}

async fn next_message(framed: &mut Framed<TcpStream, PeerCodec>) -> PeerResult<PeerMessage> {
    match framed.next().await {
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(PeerError::Protocol(e.to_string())),
        None => Err(PeerError::Protocol("peer closed the connection".into())),
    }
}

/// Wraps a future with the per-read idle timeout and races it against
/// cancellation, so a peer that goes silent or a coordinator-triggered
/// cancel both terminate the read promptly instead of hanging forever.
async fn read_with_idle_timeout<F, T>(fut: F, config: &FetchConfig, cancel: &CancellationToken) -> PeerResult<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        result = timeout(idle_timeout(config), fut) => result.map_err(|_| PeerError::Timeout),
        _ = cancel.cancelled() => Err(PeerError::Cancelled),
    }
}

fn idle_timeout(config: &FetchConfig) -> Duration {
    config.read_idle_timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_piece_len_is_full_except_last() {
        assert_eq!(expected_piece_len(0, 2, 16384 + 100), METADATA_PIECE_SIZE);
        assert_eq!(expected_piece_len(1, 2, 16384 + 100), 100);
    }

    #[test]
    fn expected_piece_len_is_full_when_exact_multiple() {
        assert_eq!(expected_piece_len(1, 2, 16384 * 2), METADATA_PIECE_SIZE);
    }

    #[test]
    fn ignorable_messages_include_fast_extension_and_keepalive() {
        assert!(is_ignorable(&PeerMessage::KeepAlive));
        assert!(is_ignorable(&PeerMessage::HaveAll));
        assert!(is_ignorable(&PeerMessage::Reject { index: 0, begin: 0, length: 0 }));
        assert!(is_ignorable(&PeerMessage::Suggest { piece_index: 0 }));
        assert!(!is_ignorable(&PeerMessage::Piece { index: 0, begin: 0, block: vec![] }));
    }
}
