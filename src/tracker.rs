//! The HTTP tracker client: the engine's one external network collaborator
//! besides peer connections. Announces download progress and obtains a list
//! of peers to try.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;

use crate::error::TrackerError;
use crate::{PeerId, Sha1Hash};

/// The port we advertise to the tracker as our listening port.
///
/// This engine never serves blocks, but still needs to report a port per
/// the tracker announce protocol.
pub const ANNOUNCE_PORT: u16 = 6889;

/// The event reported on a torrent's first announce.
const EVENT_STARTED: &str = "started";

/// Per-announce statistics the engine reports to the tracker.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// The result of a successful announce: how long to wait before the next
/// one, and the peers the tracker returned.
#[derive(Clone, Debug)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

/// The tracker client for a single torrent.
pub struct Tracker {
    client: reqwest::Client,
    announce_url: String,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    announced_before: bool,
}

impl Tracker {
    pub fn new(announce_url: String, info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            client: reqwest::Client::new(),
            announce_url,
            info_hash,
            peer_id,
            announced_before: false,
        }
    }

    /// Issues an announce request, reporting `stats` and requesting peers.
    ///
    /// On the very first call, the request carries `event=started`.
    pub async fn announce(
        &mut self,
        stats: AnnounceStats,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            encode_bytes(&self.info_hash),
            encode_bytes(&self.peer_id),
            ANNOUNCE_PORT,
            stats.uploaded,
            stats.downloaded,
            stats.left,
        );
        if !self.announced_before {
            url.push_str(&format!("&event={}", EVENT_STARTED));
        }

        log::debug!("Announcing to tracker: {}", url);
        let body = self.client.get(&url).send().await?.bytes().await?;
        raise_for_failure(&body)?;

        let response: RawAnnounceResponse = serde_bencode::from_bytes(&body)?;
        self.announced_before = true;

        let peers = decode_compact_peers(&response.peers);
        Ok(AnnounceResponse {
            interval: Duration::from_secs(response.interval),
            peers,
        })
    }

    /// A best-effort final announce on shutdown, discarding the peer list
    /// in the response.
    pub async fn final_announce(&mut self, stats: AnnounceStats) -> Result<(), TrackerError> {
        self.announce(stats).await.map(|_| ())
    }
}

/// A tracker response containing a `failure reason`-shaped message is
/// detected heuristically: attempt a UTF-8 decode of the raw body and look
/// for "failure" (a successful compact response is binary and will not
/// decode as UTF-8).
fn raise_for_failure(body: &[u8]) -> Result<(), TrackerError> {
    if let Ok(text) = std::str::from_utf8(body) {
        if text.contains("failure") {
            return Err(TrackerError::Failure(text.to_string()));
        }
    }
    Ok(())
}

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// Decodes a compact peer list: 6 bytes per peer, 4-byte IPv4 address
/// followed by a 2-byte big-endian port.
fn decode_compact_peers(raw: &[u8]) -> Vec<SocketAddr> {
    raw.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    interval: u64,
    peers: ByteBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_compact_peers() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[192, 168, 0, 1, 0x1A, 0xE1]);
        raw.extend_from_slice(&[10, 0, 0, 2, 0x00, 0x50]);

        let peers = decode_compact_peers(&raw);
        assert_eq!(peers.len(), 2);
        assert_eq!(
            peers[0],
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 6881))
        );
        assert_eq!(
            peers[1],
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80))
        );
    }

    #[test]
    fn test_raise_for_failure_detects_failure_reason() {
        let body = b"d14:failure reason20:torrent not founde";
        let err = raise_for_failure(body).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(_)));
    }

    #[test]
    fn test_raise_for_failure_ignores_binary_compact_response() {
        // compact peer bytes are not guaranteed valid utf-8, and even when
        // they are, shouldn't contain the word "failure"
        let body = vec![0xFFu8, 0x00, 0x01, 0x02, 0x1A, 0xE1];
        assert!(raise_for_failure(&body).is_ok());
    }

    #[tokio::test]
    async fn test_announce_against_mock_tracker() {
        let mut peers = Vec::new();
        peers.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        let mut resp_body = Vec::new();
        resp_body.extend_from_slice(b"d8:intervali1800e5:peers");
        resp_body.extend_from_slice(format!("{}:", peers.len()).as_bytes());
        resp_body.extend_from_slice(&peers);
        resp_body.extend_from_slice(b"e");

        let _mock = mockito::mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(resp_body)
            .create();

        let mut tracker = Tracker::new(mockito::server_url(), [0; 20], [1; 20]);
        let response = tracker
            .announce(AnnounceStats { uploaded: 0, downloaded: 0, left: 100 })
            .await
            .unwrap();

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.peers.len(), 1);
    }
}
